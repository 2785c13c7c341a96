use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod actions;

use actions::{Action, Inbound, Outbound};
use ussd_relay::config::RelayConfig;
use ussd_relay::platform::adb::AdbClient;
use ussd_relay::platform::Platform;
use ussd_relay::{ReplyChannel, UssdPlugin};

/// Reply-channel pushes leave as bridge lines
struct StdoutChannel {
    tx: mpsc::UnboundedSender<Outbound>,
}

#[async_trait::async_trait]
impl ReplyChannel for StdoutChannel {
    async fn push(&self, message: &str) -> Result<()> {
        self.tx
            .send(Outbound::Push {
                message: message.to_string(),
            })
            .map_err(|_| anyhow::anyhow!("bridge writer closed"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::load()?;

    // Initialize logging; stdout belongs to the bridge
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.log_filter.parse()?),
        )
        .init();

    let client = Arc::new(AdbClient::new(&config));
    if !client.shell().is_device_ready().await {
        warn!("No adb device ready; requests will fail until one is attached");
    }

    // Create event channels
    let (tx, mut rx) = mpsc::unbounded_channel::<Action>();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

    // Spawn bridge writer
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            let mut json = match serde_json::to_string(&line) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Could not encode {:?}: {}", line, e);
                    continue;
                }
            };
            json.push('\n');
            if stdout.write_all(json.as_bytes()).await.is_err() {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });

    // Spawn stdin reader
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let action = match serde_json::from_str::<Inbound>(&line) {
                        Ok(inbound) => Action::Inbound(inbound),
                        Err(e) => Action::Error(format!("Malformed line {:?}: {}", line, e)),
                    };
                    let _ = tx.send(action);
                }
                Ok(None) => {
                    let _ = tx.send(Action::Quit);
                    break;
                }
                Err(e) => {
                    let _ = tx.send(Action::Error(format!("stdin: {}", e)));
                    let _ = tx.send(Action::Quit);
                    break;
                }
            }
        }
    });

    let plugin = Arc::new(UssdPlugin::new(
        Platform::from_backend(client),
        Arc::new(StdoutChannel { tx: out_tx.clone() }),
    ));
    info!("ussd-relay ready");

    // Main event loop; every request runs on its own task so that replies
    // and cancels get through while a session is waiting
    while let Some(action) = rx.recv().await {
        match action {
            Action::Inbound(Inbound::Message { id, message }) => {
                let plugin = plugin.clone();
                let out = out_tx.clone();
                tokio::spawn(async move {
                    match plugin.on_message(message.as_deref()).await {
                        Some(reply) => {
                            let result = reply.map(Value::String).unwrap_or(Value::Null);
                            let _ = out.send(Outbound::Result { id, result });
                        }
                        None => debug!("Message {} dropped", id),
                    }
                });
            }
            Action::Inbound(inbound) => {
                let Some((id, call)) = inbound.into_call() else {
                    continue;
                };
                let plugin = plugin.clone();
                let out = out_tx.clone();
                tokio::spawn(async move {
                    let outcome = plugin.handle(&call).await;
                    match Outbound::from_outcome(id, outcome) {
                        Some(line) => {
                            let _ = out.send(line);
                        }
                        None => info!("{} ({}) waits for a permission grant", call.method, id),
                    }
                });
            }
            Action::Error(msg) => warn!("{}", msg),
            Action::Quit => break,
        }
    }

    // Restore the device
    plugin.cancel_multisession().await;
    drop(plugin);
    drop(out_tx);
    let _ = tokio::time::timeout(Duration::from_millis(500), writer).await;
    info!("ussd-relay stopped");
    Ok(())
}
