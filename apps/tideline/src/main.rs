use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tideline_client_core::cli::Cli;
use tideline_client_core::client::{SceneState, SceneUpdate};
use tideline_client_core::config::ClientConfig;
use tideline_client_core::protocol::{BackMsg, RerunRequest};
use tideline_client_core::session::{ConnectionManager, ConnectionState, SessionEvent};
use tideline_client_core::telemetry::logging;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialize logging")?;

    let mut config = ClientConfig::from_env().context("invalid environment configuration")?;
    cli.apply(&mut config).context("invalid command line")?;
    info!(servers = ?config.servers.iter().map(|url| url.as_str()).collect::<Vec<_>>(), "starting");

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut manager = ConnectionManager::new(config, Arc::new(events_tx))
        .context("failed to build session manager")?;
    manager.connect();

    let mut scene = SceneState::default();
    let mut rerun_pending = cli.rerun;
    let mut heartbeat = tokio::time::interval(cli.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupt received; disconnecting");
                break;
            }
            _ = heartbeat.tick() => {
                if manager.is_connected() {
                    manager.send(BackMsg::AppHeartbeat);
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    SessionEvent::StateChanged { state, error } => {
                        match &error {
                            Some(error) => warn!(state = %state, error = %error, "connection state changed"),
                            None => info!(state = %state, "connection state changed"),
                        }
                        if state == ConnectionState::Connected && rerun_pending {
                            manager.send(BackMsg::RerunScript(RerunRequest::default()));
                            rerun_pending = false;
                        }
                        if state.is_terminal() {
                            break;
                        }
                    }
                    SessionEvent::Message(msg) => match scene.handle_message(&msg) {
                        Ok(SceneUpdate::RunFinished { max_cached_message_age }) => {
                            manager.increment_message_cache_run_count(max_cached_message_age);
                            let summary = scene.summary();
                            info!(
                                run = %scene.generation(),
                                main = summary.main_children,
                                sidebar = summary.sidebar_children,
                                elements = summary.elements,
                                errors = summary.errors,
                                cached = manager.cache().len(),
                                "run finished"
                            );
                        }
                        Ok(SceneUpdate::SessionStarted { session_id }) => {
                            debug!(session_id = %session_id, run = %scene.generation(), "run started");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, path = ?msg.metadata.delta_path, "failed to apply delta");
                        }
                    },
                    SessionEvent::Retry { attempt, description, delay } => {
                        info!(attempt, delay_ms = delay.as_millis() as u64, "{description}");
                    }
                    SessionEvent::AllowedOrigins(host_config) => {
                        debug!(origins = ?host_config.allowed_origins, "host config received");
                    }
                    SessionEvent::ConnectionError(description) => {
                        error!("{description}");
                    }
                }
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
