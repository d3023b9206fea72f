use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [controller::SonarQube::crd(), controller::SonarQubeServer::crd()];
    let docs = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    print!("{}", docs.join("---\n"));
    Ok(())
}
