use anyhow::Context;
use tracing::info;

use nodepool_core::{HintOverlay, NodepoolConfig};
use nodepool_provision::{CreateRequest, DriverRegistry, Provisioner};

use super::print_json;

fn registry(config: &NodepoolConfig) -> anyhow::Result<&'static DriverRegistry> {
    Ok(DriverRegistry::from_config(config)?.install())
}

pub fn types(config: &NodepoolConfig) -> anyhow::Result<()> {
    print_json(&registry(config)?.types())
}

pub async fn create(
    config: &NodepoolConfig,
    node_type: &str,
    num: u32,
    os_type: String,
    os_version: String,
    arch: Option<String>,
    hints: &[String],
) -> anyhow::Result<()> {
    let hints = hints
        .iter()
        .map(|raw| {
            serde_json::from_str::<HintOverlay>(raw).with_context(|| format!("invalid --hint {raw}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let provisioner = registry(config)?.provisioner(node_type)?;
    let request = CreateRequest {
        num,
        os_type,
        os_version,
        arch,
        hints,
    };
    let fqdns = provisioner.create(&request).await?;
    info!(%node_type, count = fqdns.len(), "nodes ready");
    print_json(&fqdns)
}

pub async fn destroy(config: &NodepoolConfig, node_type: &str, name_or_id: &str) -> anyhow::Result<()> {
    let provisioner = registry(config)?.provisioner(node_type)?;
    provisioner.destroy(name_or_id).await?;
    Ok(())
}
