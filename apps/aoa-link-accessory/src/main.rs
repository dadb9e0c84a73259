use std::{path::PathBuf, process::exit, sync::Arc, time::Duration};

use aoa_link_comm::accessory::AccessoryNode;
use aoa_link_core::{
    config::LinkConfig,
    transport::{Transporter, message_channel},
};
use futures_util::StreamExt;
use log::{LevelFilter, debug, error, info, warn};
use tokio::task::spawn_blocking;

const SHUTDOWN_WAIT: Duration = Duration::from_secs(1);

/// Usage: `aoa-link-accessory [config.json] [device node]`
///
/// Answers every message from the host with an acknowledgement.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::builder()
        .filter_level(LevelFilter::Debug)
        .parse_default_env()
        .init();

    let mut args = std::env::args_os().skip(1).map(PathBuf::from);
    let config = LinkConfig::load(args.next().as_deref());
    let device_path = args
        .next()
        .unwrap_or_else(|| config.accessory_device.path.clone());

    let node = match AccessoryNode::open(&device_path) {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to open accessory device {device_path:?}: {e}");
            exit(1);
        }
    };

    let (handler, mut messages) = message_channel();
    let transporter =
        match Transporter::spawn(node, &config.transport.options(), Arc::new(handler)) {
            Ok(transporter) => Arc::new(transporter),
            Err(e) => {
                error!("Failed to start transport: {e}");
                exit(1);
            }
        };

    info!("Accessory ready on {device_path:?}");
    loop {
        tokio::select! {
            message = messages.next() => {
                let Some(message) = message else {
                    info!("Transport stopped");
                    break;
                };
                info!("Host says: {message}");

                let reply = format!("Roger that, [{message}]");
                let transporter = transporter.clone();
                match spawn_blocking(move || transporter.send(&reply)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Reply not sent: {e}"),
                    Err(e) => error!("Send task panicked: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    transporter.close();
    if !transporter.wait_stopped(SHUTDOWN_WAIT) {
        debug!("Reader still blocked on the device node");
    }
}
