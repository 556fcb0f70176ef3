//! Prints the CustomResourceDefinitions of the fleet CRDs as a multi-document
//! YAML stream, ready for `kubectl apply -f -`.

use crds::{Project, Seed};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let definitions = [Seed::crd(), Project::crd()];
    for crd in &definitions {
        print!("---\n{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
