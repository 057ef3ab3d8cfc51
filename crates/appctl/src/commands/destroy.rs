//! Contains functionality of the destroy container command
use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;
use libappcontainer::container::LifecycleManager;
use libappcontainer::identity::{CartridgeDescriptor, IdentityHints};

/// Tear down a container and release every node resource it holds
#[derive(Parser, Debug)]
pub struct Destroy {
    #[clap(long = "with-app-uuid")]
    pub app_uuid: Option<String>,
    #[clap(long = "with-app-name")]
    pub app_name: Option<String>,
    #[clap(long = "with-container-uuid")]
    pub container_uuid: Option<String>,
    #[clap(long = "with-container-name")]
    pub container_name: Option<String>,
    #[clap(long = "with-namespace")]
    pub namespace: Option<String>,
    /// correlation id, copied into the logs and the result
    #[clap(long = "with-request-id")]
    pub request_id: Option<String>,
    #[clap(long)]
    pub cart_name: Option<String>,
    #[clap(long)]
    pub component_name: Option<String>,
    #[clap(long = "with-software-version")]
    pub software_version: Option<String>,
    #[clap(long)]
    pub cartridge_vendor: Option<String>,
}

impl From<Destroy> for IdentityHints {
    fn from(args: Destroy) -> Self {
        Self {
            application_uuid: args.app_uuid,
            application_name: args.app_name,
            container_uuid: args.container_uuid,
            container_name: args.container_name,
            namespace: args.namespace,
            request_id: args.request_id,
            cartridge: CartridgeDescriptor {
                name: args.cart_name,
                vendor: args.cartridge_vendor,
                component: args.component_name,
                software_version: args.software_version,
            },
        }
    }
}

/// Prints the result as JSON. A partial teardown is a result, not an error;
/// only resolution and state store failures make the command fail.
pub fn destroy<W: Write>(args: Destroy, manager: &LifecycleManager, out: &mut W) -> Result<()> {
    let hints = IdentityHints::from(args);
    tracing::debug!(?hints, "start destroying");
    let result = manager
        .destroy(&hints)
        .with_context(|| format!("failed to destroy container {hints:?}"))?;
    writeln!(out, "{}", serde_json::to_string_pretty(&result)?)?;
    Ok(())
}
