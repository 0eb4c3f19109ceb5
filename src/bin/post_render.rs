//! Helm post-renderer: reads rendered manifests on stdin and writes them back to stdout with
//! ownership of the installing IstioRevision stamped on every object.

use anyhow::Context;
use clap::Parser;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use istio_operator::helm::post_render::{stamp_manifests, OwnerStamp};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Controller owner reference of the installing revision, as JSON
    #[arg(long = "owner-reference", value_parser = parse_owner_reference)]
    owner_reference: OwnerReference,

    /// Namespace of the installing revision
    #[arg(long = "owner-namespace")]
    owner_namespace: String,
}

fn parse_owner_reference(s: &str) -> Result<OwnerReference, serde_json::Error> {
    serde_json::from_str(s)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Arguments::parse();

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("reading manifests from stdin")?;

    let output = stamp_manifests(
        &input,
        &OwnerStamp {
            reference: args.owner_reference,
            namespace: args.owner_namespace,
        },
    )?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(output.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}
