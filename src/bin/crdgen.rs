use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let resources = [
        object_store_operator::resources::ObjectStore::crd(),
        object_store_operator::resources::ObjectBucketClaim::crd(),
    ];

    for resource in resources {
        println!("---");
        print!("{}", serde_yaml::to_string(&resource)?);
    }
    Ok(())
}
