use kube::CustomResourceExt;

use istio_operator::resources::istiorevisions::IstioRevision;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&IstioRevision::crd())?);
    Ok(())
}
