use std::{path::PathBuf, process::exit, sync::Arc, time::Duration};

use aoa_link_comm::usb::{NusbBackend, discovery::device_events};
use aoa_link_core::{config::LinkConfig, connection::ConnectionManager, transport::message_channel};
use futures_util::StreamExt;
use log::{LevelFilter, debug, error, info, warn};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    task::spawn_blocking,
};

const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Usage: `aoa-link-host [config.json]`
///
/// Switches the first compatible device that shows up into accessory mode,
/// then sends every line typed on stdin to it and logs what comes back.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::builder()
        .filter_level(LevelFilter::Debug)
        .parse_default_env()
        .init();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = LinkConfig::load(config_path.as_deref());
    debug!("Using configuration: {config:?}");

    let (handler, mut messages) = message_channel();
    let manager = Arc::new(ConnectionManager::new(
        NusbBackend,
        config.accessory.clone(),
        config.connection_options(),
        Arc::new(handler),
    ));

    let mut events = match device_events().await {
        Ok(events) => events,
        Err(e) => {
            error!("Failed to watch USB devices: {e}");
            exit(1);
        }
    };

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut timeouts = tokio::time::interval(TIMEOUT_POLL_INTERVAL);

    info!("Waiting for devices...");
    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    warn!("USB event stream ended");
                    break;
                };

                // Negotiation does blocking control transfers
                let manager = manager.clone();
                match spawn_blocking(move || manager.handle_event(event)).await {
                    Ok(Ok(state)) => debug!("Connection state: {state:?}"),
                    Ok(Err(e)) => error!("Connection attempt failed: {e}"),
                    Err(e) => {
                        error!("Device event handler panicked: {e}");
                        break;
                    }
                }
            }
            Some(message) = messages.next() => {
                info!("Accessory says: {message}");
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let manager = manager.clone();
                    match spawn_blocking(move || manager.send(&line)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("Message not sent: {e}"),
                        Err(e) => error!("Send task panicked: {e}"),
                    }
                }
                Ok(None) => {
                    debug!("stdin closed, no more messages will be sent");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {e}");
                    stdin_open = false;
                }
            },
            _ = timeouts.tick() => {
                manager.poll_timeouts();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    manager.disconnect();
}
