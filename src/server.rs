use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{PerturbationSettings, ProjectionSettings};
use crate::engine::{EngineHandle, MorphCommand, MorphUpdate};
use crate::error::{MorphError, Result};
use crate::generator::ModelHandle;
use crate::imaging::ImageTensor;
use crate::spectrum::{ChannelSpectrum, PowerSpectrumSample};

/// Inbound websocket messages.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Spectrum(ChannelSpectrum),
    ReseedRandom,
    ReseedFromProjection,
    Project { target_path: PathBuf },
    CancelProjection,
    Perturbation {
        damping_of_change: f32,
        morph_delay_ms: u64,
    },
    /// Settings for the next projection session; a running session keeps its own.
    Projection {
        learning_rate: f64,
        training_steps: usize,
        steps_per_image: usize,
        num_projections: usize,
        #[serde(default)]
        seed: Option<u64>,
    },
    Animate,
    Generate,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Health {
    pub model_id: String,
    pub latent_dim: usize,
    pub display_size: usize,
}

#[derive(Clone)]
pub struct ServerState {
    commands: mpsc::Sender<MorphCommand>,
    samples: watch::Sender<Option<PowerSpectrumSample>>,
    updates: broadcast::Sender<MorphUpdate>,
    handle: Arc<ModelHandle>,
    channel: String,
}

impl ServerState {
    /// `channel` is the electrode whose spectra drive the morph.
    pub fn new(engine: &EngineHandle, handle: Arc<ModelHandle>, channel: impl Into<String>) -> Self {
        Self::from_channels(
            engine.commands(),
            engine.samples(),
            engine.updates(),
            handle,
            channel,
        )
    }

    pub fn from_channels(
        commands: mpsc::Sender<MorphCommand>,
        samples: watch::Sender<Option<PowerSpectrumSample>>,
        updates: broadcast::Sender<MorphUpdate>,
        handle: Arc<ModelHandle>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            commands,
            samples,
            updates,
            handle,
            channel: channel.into(),
        }
    }

    /// Route one control message to the engine.
    pub async fn dispatch(&self, message: ControlMessage) -> Result<()> {
        let command = match message {
            ControlMessage::Spectrum(spectrum) => {
                if spectrum.channel != self.channel {
                    return Ok(());
                }
                self.samples.send_replace(Some(spectrum.into_sample()));
                return Ok(());
            }
            ControlMessage::ReseedRandom => MorphCommand::ReseedRandom,
            ControlMessage::ReseedFromProjection => MorphCommand::ReseedFromProjection,
            ControlMessage::Project { target_path } => {
                let target = self.load_target(target_path).await?;
                MorphCommand::Project { target }
            }
            ControlMessage::CancelProjection => MorphCommand::CancelProjection,
            ControlMessage::Perturbation {
                damping_of_change,
                morph_delay_ms,
            } => MorphCommand::SetPerturbation(PerturbationSettings {
                damping_of_change,
                morph_delay_ms,
            }),
            ControlMessage::Projection {
                learning_rate,
                training_steps,
                steps_per_image,
                num_projections,
                seed,
            } => MorphCommand::SetProjection(ProjectionSettings {
                learning_rate,
                training_steps,
                steps_per_image,
                num_projections,
                seed,
            }),
            ControlMessage::Animate => MorphCommand::Animate,
            ControlMessage::Generate => MorphCommand::GenerateRandom,
        };
        self.commands
            .send(command)
            .await
            .map_err(|_| MorphError::InvalidSettings("morph engine has stopped".to_string()))
    }

    async fn load_target(&self, path: PathBuf) -> Result<ImageTensor> {
        let side = self.handle.display_size();
        let device = self.handle.device().clone();
        tokio::task::spawn_blocking(move || ImageTensor::load_target(&path, side, &device))
            .await
            .map_err(|e| MorphError::InvalidSettings(format!("target load aborted: {e}")))?
    }

    fn health(&self) -> Health {
        Health {
            model_id: self.handle.profile().model_id.clone(),
            latent_dim: self.handle.latent_dim(),
            display_size: self.handle.display_size(),
        }
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Bind and serve until the listener fails.
pub async fn serve(addr: SocketAddr, state: ServerState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, channel = %state.channel, "morph websocket server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<ServerState>) -> Json<Health> {
    Json(state.health())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx_update = state.updates.subscribe();
    debug!("websocket client connected");

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx_update.recv().await {
                Ok(update) => {
                    let json = match serde_json::to_string(&update) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "failed to encode update");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "slow websocket client skipped frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                match serde_json::from_str::<ControlMessage>(&text) {
                    Ok(message) => {
                        if let Err(e) = state.dispatch(message).await {
                            warn!(error = %e, "control message failed");
                            let _ = state.updates.send(MorphUpdate::Rejected {
                                reason: e.to_string(),
                            });
                        }
                    }
                    Err(e) => debug!(error = %e, "ignoring malformed control message"),
                }
            }
            _ = &mut send_task => break,
        }
    }

    send_task.abort();
    debug!("websocket client disconnected");
}
