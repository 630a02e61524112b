use kube::CustomResourceExt;
use nodegroup_drainer::crd::NodeGroup;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&NodeGroup::crd())?);
    Ok(())
}
