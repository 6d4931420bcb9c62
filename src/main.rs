use clap::Parser;
use tokio::sync::mpsc;

use ftms_bike::bluez::BluezTransport;
use ftms_bike::config::Args;
use ftms_bike::control::ControlPoint;
use ftms_bike::debug_server;
use ftms_bike::session::{self, EngineHandle, Session};

#[tokio::main]
async fn main() {
    env_logger::init();

    let cfg = match Args::parse().resolve() {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    log::info!(
        "FTMS bike starting as '{}', debug port: {}",
        cfg.identity().local_name(),
        cfg.debug_port
    );

    let (events_tx, events_rx) = mpsc::channel(32);
    let transport = match BluezTransport::open(cfg.adapter.as_deref(), events_tx).await {
        Ok(transport) => transport,
        Err(e) => {
            log::error!("Failed to open Bluetooth adapter: {}", e);
            std::process::exit(1);
        }
    };

    let session = Session::new(cfg.identity(), cfg.capability())
        .with_control_point(ControlPoint::new(cfg.require_control));
    let (handle, inbox) = EngineHandle::pair();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received shutdown signal");
        }
        result = session::run(session, transport, events_rx, inbox, cfg.tick()) => {
            if let Err(e) = result {
                log::error!("FTMS session exited with error: {}", e);
            }
        }
        result = debug_server::run(handle, cfg.debug_port) => {
            if let Err(e) = result {
                log::error!("Debug server exited with error: {}", e);
            }
        }
    }

    log::info!("FTMS bike shutting down");
}
