//! Print the CRD manifests for the types defined in this crate.
//!
//! `BareMetalHost` is owned by the bare-metal operator; its manifest is only
//! printed with `--all` for local test clusters.

use crds::{BareMetalHost, Machine};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let all = std::env::args().any(|arg| arg == "--all");

    print!("{}", serde_yaml::to_string(&Machine::crd())?);
    if all {
        println!("---");
        print!("{}", serde_yaml::to_string(&BareMetalHost::crd())?);
    }

    Ok(())
}
