//! RBAC objects derived from a `Project`.
//!
//! Every project gets one ClusterRole and one ClusterRoleBinding per
//! membership group. The role grants access to the project object itself;
//! the binding names the group's users plus a `<group>-<project>` group.

use crds::{Project, ProjectGroup};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use kube::ResourceExt;
use reconciling::{ManagedObject, NamedObject, ObjectModifier, owner_labels};
use std::collections::BTreeMap;

/// Label naming the tool that manages an object
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`] on RBAC objects of this controller
pub const MANAGED_BY: &str = "fleet-rbac-controller";
/// Label carrying the owning project's name
pub const PROJECT_LABEL: &str = "fleet.microscaler.io/project";

const API_GROUP: &str = "fleet.microscaler.io";
const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Selector matching every object this controller manages
#[must_use]
pub fn managed_by_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY}")
}

/// `fleet:project-<project>:<group>`
#[must_use]
pub fn role_name(project: &str, group: ProjectGroup) -> String {
    format!("fleet:project-{project}:{}", group.as_str())
}

/// `<group>-<project>`
#[must_use]
pub fn group_subject(project: &str, group: ProjectGroup) -> String {
    format!("{}-{project}", group.as_str())
}

fn verbs(group: ProjectGroup) -> Vec<String> {
    let verbs: &[&str] = match group {
        ProjectGroup::Owners => &["*"],
        ProjectGroup::Editors => &["get", "list", "watch", "update", "patch"],
        ProjectGroup::Viewers => &["get", "list", "watch"],
    };
    verbs.iter().map(|verb| (*verb).to_string()).collect()
}

/// Labels identifying the RBAC objects of `project`
#[must_use]
pub fn project_labels(project: &str) -> ObjectModifier {
    owner_labels(BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (PROJECT_LABEL.to_string(), project.to_string()),
    ]))
}

fn cluster_role(project: &str, group: ProjectGroup) -> ManagedObject {
    let project = project.to_string();
    ManagedObject::ClusterRole(NamedObject::new(role_name(&project, group), move |mut role: ClusterRole| {
        role.rules = Some(vec![PolicyRule {
            api_groups: Some(vec![API_GROUP.to_string()]),
            resources: Some(vec!["projects".to_string()]),
            resource_names: Some(vec![project.clone()]),
            verbs: verbs(group),
            ..Default::default()
        }]);
        Ok(role)
    }))
}

fn cluster_role_binding(project: &str, group: ProjectGroup, members: &[String]) -> ManagedObject {
    let project = project.to_string();
    let mut subjects: Vec<Subject> = members
        .iter()
        .map(|user| Subject {
            api_group: Some(RBAC_API_GROUP.to_string()),
            kind: "User".to_string(),
            name: user.clone(),
            namespace: None,
        })
        .collect();
    subjects.push(Subject {
        api_group: Some(RBAC_API_GROUP.to_string()),
        kind: "Group".to_string(),
        name: group_subject(&project, group),
        namespace: None,
    });

    ManagedObject::ClusterRoleBinding(NamedObject::new(
        role_name(&project, group),
        move |mut binding: ClusterRoleBinding| {
            binding.role_ref = RoleRef {
                api_group: RBAC_API_GROUP.to_string(),
                kind: "ClusterRole".to_string(),
                name: role_name(&project, group),
            };
            binding.subjects = Some(subjects.clone());
            Ok(binding)
        },
    ))
}

/// Desired RBAC objects of `project`: roles first, then their bindings
#[must_use]
pub fn project_objects(project: &Project) -> Vec<ManagedObject> {
    let name = project.name_any();
    let roles = ProjectGroup::ALL.iter().map(|group| cluster_role(&name, *group));
    let bindings = ProjectGroup::ALL
        .iter()
        .map(|group| cluster_role_binding(&name, *group, project.spec.members(*group)));
    roles.chain(bindings).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::ProjectSpec;
    use reconciling::{MockObjectStore, ObjectReconciler, ReconcileOutcome};

    fn project() -> Project {
        Project::new(
            "payments",
            ProjectSpec {
                name: "Payments".to_string(),
                owners: vec!["alice".to_string()],
                editors: vec!["bob".to_string()],
                viewers: vec![],
            },
        )
    }

    #[test]
    fn test_names() {
        assert_eq!(role_name("payments", ProjectGroup::Viewers), "fleet:project-payments:viewers");
        assert_eq!(group_subject("payments", ProjectGroup::Owners), "owners-payments");
        assert_eq!(managed_by_selector(), "app.kubernetes.io/managed-by=fleet-rbac-controller");
    }

    #[test]
    fn test_objects_are_ordered_roles_then_bindings() {
        let objects = project_objects(&project());
        let kinds: Vec<&str> = objects.iter().map(ManagedObject::kind).collect();
        assert_eq!(
            kinds,
            ["ClusterRole", "ClusterRole", "ClusterRole", "ClusterRoleBinding", "ClusterRoleBinding", "ClusterRoleBinding"]
        );
    }

    #[tokio::test]
    async fn test_reconciled_objects_carry_rules_subjects_and_labels() {
        let store = MockObjectStore::new();
        let reconciler = ObjectReconciler::new(store.clone());

        let report = reconciler
            .reconcile_objects(None, &project_objects(&project()), &[project_labels("payments")])
            .await;
        assert!(!report.has_failures());

        let editors: ClusterRole = store.object(None, "fleet:project-payments:editors").unwrap();
        let rule = &editors.rules.unwrap()[0];
        assert_eq!(rule.resource_names.as_deref(), Some(&["payments".to_string()][..]));
        assert!(rule.verbs.contains(&"patch".to_string()));
        assert!(!rule.verbs.contains(&"delete".to_string()));
        assert_eq!(
            editors.metadata.labels.unwrap().get(PROJECT_LABEL).map(String::as_str),
            Some("payments")
        );

        let owners: ClusterRoleBinding = store.object(None, "fleet:project-payments:owners").unwrap();
        let subjects: Vec<(String, String)> = owners
            .subjects
            .unwrap()
            .into_iter()
            .map(|s| (s.kind, s.name))
            .collect();
        assert_eq!(
            subjects,
            [
                ("User".to_string(), "alice".to_string()),
                ("Group".to_string(), "owners-payments".to_string())
            ]
        );
        assert_eq!(owners.role_ref.name, "fleet:project-payments:owners");

        let again = reconciler
            .reconcile_objects(None, &project_objects(&project()), &[project_labels("payments")])
            .await;
        assert!(
            again
                .results
                .iter()
                .all(|result| result.outcome == ReconcileOutcome::Unchanged)
        );
    }
}
