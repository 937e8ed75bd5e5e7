use anyhow::Result;

/// Prints all custom resource definitions as a multi-document YAML stream.
fn main() -> Result<()> {
    for crd in greenhouse_apis::all_crds() {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
