use kube::CustomResourceExt;
use std::fs;
use kaito_types::*;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/kaito.sh_workspace_crd.yaml",
        serde_yaml::to_string(&Workspace::crd()).unwrap(),
    )
    .unwrap();
}
