//! Zigbee coordinator binary.
//!
//! Loads (or forms) the Trust Center state, connects to the radio bridge and
//! runs the protocol engine until Ctrl-C or a fatal error.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zb_stack::{Stack, StackEvent};
use zb_storage::{FileStateStore, StateStore};

mod bridge;
mod config;
mod logging;

use config::CoordinatorConfig;
use logging::CoordinatorLogFormatter;

/// Zigbee PRO coordinator and Trust Center
#[derive(Parser, Debug)]
#[command(name = "zb-coordinator", version, about = "Zigbee PRO coordinator and Trust Center")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "coordinator.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// State file, overrides the configuration
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Radio bridge address, e.g. 127.0.0.1:9999
    #[arg(long)]
    bridge: Option<String>,

    /// Open joins after startup, e.g. 60s
    #[arg(long)]
    permit_join: Option<humantime::Duration>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("zb_coordinator={}", args.log_level).parse()?)
        .add_directive(format!("zb_stack={}", args.log_level).parse()?)
        .add_directive(format!("zb_storage={}", args.log_level).parse()?)
        .add_directive(format!("zb_routing={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(CoordinatorLogFormatter::new("zb-coordinator"))
        .init();

    info!("Starting Zigbee coordinator v{}", env!("CARGO_PKG_VERSION"));

    let mut config = CoordinatorConfig::load_from_file(&args.config)?;
    if let Some(state_file) = args.state_file {
        config.state_file = state_file;
    }
    if let Some(bridge) = args.bridge {
        config.bridge_addr = bridge;
    }
    if let Some(permit_join) = args.permit_join {
        config.permit_join_secs = Duration::from(permit_join).as_secs();
    }

    let store = Arc::new(
        FileStateStore::new(&config.state_file)
            .with_context(|| format!("Cannot use state file {:?}", config.state_file))?,
    );
    let state = match store
        .load()
        .await
        .with_context(|| format!("Saved state in {:?} is unusable", config.state_file))?
    {
        Some(state) => {
            info!(
                "Resuming network PAN 0x{:04x} with {} devices",
                state.network.pan_id,
                state.devices.len()
            );
            if config.network.pan_id.is_some_and(|pan_id| pan_id != state.network.pan_id) {
                warn!("Configured PAN ID ignored, the saved network takes precedence");
            }
            state
        }
        None => config.form_network()?,
    };

    let (transport, reader) = bridge::connect(&config.bridge_addr)
        .await
        .with_context(|| format!("Cannot reach radio bridge at {}", config.bridge_addr))?;

    let (stack, handle, inbound, events) =
        Stack::new(config.stack.clone(), state, store, Box::new(transport));
    let reader_task = reader.spawn(inbound);
    let event_task = tokio::spawn(log_events(events));
    let mut engine = tokio::spawn(stack.run());

    if config.permit_join_secs > 0 {
        let duration = Duration::from_secs(config.permit_join_secs);
        if let Err(e) = handle.permit_join(duration).await {
            warn!("Failed to open joins: {}", e);
        }
    }

    let result = tokio::select! {
        result = &mut engine => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            if let Err(e) = handle.stop().await {
                warn!("Engine did not acknowledge stop: {}", e);
            }
            engine.await
        }
    };

    reader_task.abort();
    drop(handle);
    let _ = event_task.await;

    result
        .context("Engine task panicked")?
        .context("Coordinator stopped on a fatal error")?;
    info!("Coordinator shut down");
    Ok(())
}

async fn log_events(mut events: mpsc::UnboundedReceiver<StackEvent>) {
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => match event {
                StackEvent::FatalError { .. } => component_error!("events", "{}", json),
                _ => component_info!("events", "{}", json),
            },
            Err(e) => warn!("Cannot serialize event: {}", e),
        }
    }
}
