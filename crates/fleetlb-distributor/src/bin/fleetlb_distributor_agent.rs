//! Distributor agent entry point.
//!
//! Boots the engine against the local Open vSwitch and serves the HTTP API
//! until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};

use fleetlb_core::{init_logging, LogFormat};
use fleetlb_distributor::server::serve;
use fleetlb_distributor::{DistributorConfig, DistributorEngine, OvsSwitch};

#[tokio::main]
async fn main() -> Result<()> {
    let config = DistributorConfig::from_env().context("load distributor configuration")?;
    let format = if config.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    };
    init_logging(format);

    let switch = Arc::new(OvsSwitch::new(config.openflow_protocol.clone()));
    let addr = config.listen_addr;
    let engine = Arc::new(DistributorEngine::new(switch, config));

    let boot = engine.start().await.context("boot distributor engine")?;
    tracing::info!(state = boot.state.as_str(), "distributor engine started");

    let result = serve(Arc::clone(&engine), addr).await;
    engine.shutdown().await;
    result.context("serve distributor API")
}
