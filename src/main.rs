use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::signal;
use tracing::{info, warn};

use scrutiny_core::{
    ActiveSfdHandler, ConnectionStatus, Datastore, DeviceHandler, DeviceHandlerConfig,
    DeviceStatusSource, DummyLink, EmulatedDevice, LinkType, SfdStorage, ThreadSafeDummyLink,
};

/// Host-side server of the Scrutiny embedded debugger.
///
/// Brokers the device protocol over the configured link, mirrors the
/// connected firmware's variables into the datastore and keeps that mirror
/// coherent with the connection state.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the server configuration file (JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ServerConfig {
    device: DeviceHandlerConfig,
    sfd_dir: Option<PathBuf>,
    autoload: bool,
    tick_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            device: DeviceHandlerConfig::default(),
            sfd_dir: None,
            autoload: true,
            tick_interval_ms: 20,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ServerConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("cannot parse config file {}", path.display()))
        }
        None => Ok(ServerConfig::default()),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity.tracing_level_filter())
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_ref())?;
    info!("Starting scrutiny server with link type \"{}\"", config.device.link_type);

    let datastore = Rc::new(RefCell::new(Datastore::new()));
    let storage = Rc::new(RefCell::new(SfdStorage::new()));
    if let Some(sfd_dir) = &config.sfd_dir {
        let installed = storage
            .borrow_mut()
            .load_from_dir(sfd_dir)
            .with_context(|| format!("cannot load SFDs from {}", sfd_dir.display()))?;
        info!("Installed {installed} SFD file(s) from {}", sfd_dir.display());
    }

    let device_handler = Rc::new(RefCell::new(DeviceHandler::new(
        config.device.clone(),
        Rc::clone(&datastore),
    )?));
    let mut sfd_handler = ActiveSfdHandler::new(
        Rc::clone(&device_handler) as Rc<RefCell<dyn DeviceStatusSource>>,
        Rc::clone(&datastore),
        Rc::clone(&storage),
        config.autoload,
    );

    // Dummy links get an in-process emulated device on their far end, so the
    // whole server runs end to end without hardware.
    let mut emulator = match config.device.link_type {
        LinkType::Dummy => {
            let link = DummyLink::new();
            let endpoint = link.endpoint();
            device_handler.borrow_mut().init_comm_with_link(Box::new(link))?;
            Some(EmulatedDevice::new(Box::new(endpoint)))
        }
        LinkType::ThreadSafeDummy => {
            let link = ThreadSafeDummyLink::new();
            let endpoint = link.endpoint();
            device_handler.borrow_mut().init_comm_with_link(Box::new(link))?;
            Some(EmulatedDevice::new(Box::new(endpoint)))
        }
        _ => {
            device_handler.borrow_mut().init_comm()?;
            None
        }
    };
    if let Some(emulator) = &emulator {
        info!(
            "Emulated device online with firmware ID {}",
            emulator.firmware_id_ascii()
        );
    }

    let tick_interval = Duration::from_millis(config.tick_interval_ms.max(1));
    let mut interval = tokio::time::interval(tick_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Some(emulator) = emulator.as_mut()
                    && let Err(e) = emulator.process()
                {
                    warn!("Emulated device error. {e}");
                }
                device_handler.borrow_mut().process();
                sfd_handler.process();
            }
            _ = signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    // Graceful teardown: ask the device to close the session and give the
    // round trip a bounded number of ticks to complete.
    let connected = matches!(
        device_handler.borrow().get_connection_status(),
        ConnectionStatus::ConnectedReady | ConnectionStatus::ConnectedNotReady
    );
    if connected {
        let done = Rc::new(RefCell::new(false));
        {
            let done = Rc::clone(&done);
            device_handler
                .borrow_mut()
                .send_disconnect(Some(Box::new(move |success| {
                    if success {
                        info!("Device acknowledged the disconnection");
                    } else {
                        warn!("Disconnection completed without device acknowledgment");
                    }
                    *done.borrow_mut() = true;
                })));
        }
        for _ in 0..50 {
            if let Some(emulator) = emulator.as_mut()
                && let Err(e) = emulator.process()
            {
                warn!("Emulated device error. {e}");
            }
            device_handler.borrow_mut().process();
            sfd_handler.process();
            if *done.borrow() {
                break;
            }
            tokio::time::sleep(tick_interval).await;
        }
    }

    device_handler.borrow_mut().stop_comm();
    sfd_handler.process();
    info!("Server stopped");
    Ok(())
}
