//! Project CRD
//!
//! Groups users into owners, editors and viewers. The RBAC controller turns
//! every project into identical ClusterRoles and ClusterRoleBindings on the
//! master and on every running seed.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "fleet.microscaler.io",
    version = "v1alpha1",
    kind = "Project",
    status = "ProjectStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    /// Human readable project name
    pub name: String,

    /// Users with full control over the project
    #[serde(default)]
    pub owners: Vec<String>,

    /// Users allowed to modify project resources
    #[serde(default)]
    pub editors: Vec<String>,

    /// Users with read-only access
    #[serde(default)]
    pub viewers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    /// Project phase
    #[serde(default)]
    pub phase: ProjectPhase,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ProjectPhase {
    /// Project accepted, RBAC not yet propagated
    #[default]
    Inactive,

    /// Project in use
    Active,

    /// Project is being deleted
    Terminating,
}

/// Membership groups of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProjectGroup {
    /// Full control
    Owners,
    /// Read-write
    Editors,
    /// Read-only
    Viewers,
}

impl ProjectGroup {
    /// All groups, in the order their RBAC objects are reconciled.
    pub const ALL: [ProjectGroup; 3] = [Self::Owners, Self::Editors, Self::Viewers];

    /// Group name as used in role and subject names
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owners => "owners",
            Self::Editors => "editors",
            Self::Viewers => "viewers",
        }
    }
}

impl ProjectSpec {
    /// Users that belong to `group`.
    #[must_use]
    pub fn members(&self, group: ProjectGroup) -> &[String] {
        match group {
            ProjectGroup::Owners => &self.owners,
            ProjectGroup::Editors => &self.editors,
            ProjectGroup::Viewers => &self.viewers,
        }
    }
}
