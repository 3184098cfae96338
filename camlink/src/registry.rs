//! Per-device session registry and session actors
//!
//! Every device gets one tokio task that owns its [`SessionCore`] and media
//! pipeline. The registry only routes: packets and commands go to the task
//! over a bounded channel, and a separate oneshot lets a disconnect jump the
//! queue.

use crate::config::BridgeConfig;
use crate::event::SessionEvent;
use crate::session::{Inbound, SessionAction, SessionCore, SessionSnapshot};
use crate::transport::PacketSender;
use bytes::Bytes;
use camlink_core::{
    CamLinkError, CoreResult, NegotiatedSettings, Packet, StreamRequest, StreamSettings,
};
use camlink_media::{MediaBackend, MediaPipeline, PipelineEvent, PipelineEventKind};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

enum Command {
    Inbound(Inbound),
    Start {
        request: StreamRequest,
        reply: oneshot::Sender<CoreResult<NegotiatedSettings>>,
    },
    Stop {
        reply: oneshot::Sender<CoreResult<()>>,
    },
    ChangeSettings {
        settings: StreamSettings,
        reply: oneshot::Sender<CoreResult<NegotiatedSettings>>,
    },
    RequestKeyframe {
        reply: oneshot::Sender<CoreResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

struct SessionHandle {
    session_id: Uuid,
    commands: mpsc::Sender<Command>,
    disconnect: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Routes phone packets and user commands to per-device sessions
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, SessionHandle>>,
    config: BridgeConfig,
    backend: Arc<dyn MediaBackend>,
    sender: Arc<dyn PacketSender>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new(
        config: BridgeConfig,
        backend: Arc<dyn MediaBackend>,
        sender: Arc<dyn PacketSender>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.session.event_capacity);
        Ok(Self {
            sessions: Arc::new(DashMap::new()),
            config,
            backend,
            sender,
            events,
        })
    }

    /// Subscribe to events from all sessions
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Route a packet from a device
    ///
    /// A capability announcement from an unknown device creates its session;
    /// anything else from an unknown device is rejected.
    pub async fn handle_packet(
        &self,
        device_id: &str,
        packet: Packet,
        payload: Option<Bytes>,
    ) -> CoreResult<()> {
        let inbound = Inbound::from_packet(&packet, payload)?;
        let commands = if inbound.is_capability() {
            self.sessions
                .entry(device_id.to_string())
                .or_insert_with(|| self.spawn_session(device_id))
                .commands
                .clone()
        } else {
            self.commands(device_id)?
        };
        commands
            .send(Command::Inbound(inbound))
            .await
            .map_err(|_| CamLinkError::SessionClosed {
                device_id: device_id.to_string(),
            })
    }

    /// Validate and start a stream
    pub async fn start(
        &self,
        device_id: &str,
        request: StreamRequest,
    ) -> CoreResult<NegotiatedSettings> {
        self.request(device_id, |reply| Command::Start { request, reply })
            .await?
    }

    /// Stop the active stream
    pub async fn stop(&self, device_id: &str) -> CoreResult<()> {
        self.request(device_id, |reply| Command::Stop { reply })
            .await?
    }

    /// Change settings of the running stream
    pub async fn change_settings(
        &self,
        device_id: &str,
        settings: StreamSettings,
    ) -> CoreResult<NegotiatedSettings> {
        self.request(device_id, |reply| Command::ChangeSettings { settings, reply })
            .await?
    }

    /// Ask the phone for a keyframe
    pub async fn request_keyframe(&self, device_id: &str) -> CoreResult<()> {
        self.request(device_id, |reply| Command::RequestKeyframe { reply })
            .await?
    }

    /// Current view of a session
    pub async fn snapshot(&self, device_id: &str) -> CoreResult<SessionSnapshot> {
        self.request(device_id, |reply| Command::Snapshot { reply })
            .await
    }

    /// The transport lost a device
    ///
    /// Returns once the session's device has been released.
    pub async fn disconnect(&self, device_id: &str) -> CoreResult<()> {
        let (_, handle) =
            self.sessions
                .remove(device_id)
                .ok_or_else(|| CamLinkError::SessionNotFound {
                    device_id: device_id.to_string(),
                })?;
        info!(
            "Disconnecting {} (session {})",
            device_id, handle.session_id
        );
        let _ = handle.disconnect.send(());
        if let Err(e) = handle.task.await {
            error!("Session task for {} ended abnormally: {}", device_id, e);
        }
        Ok(())
    }

    /// Devices with a live session
    pub fn device_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Disconnect every device
    pub async fn shutdown(&self) {
        let device_ids = self.device_ids();
        info!("Shutting down {} session(s)", device_ids.len());
        let results = futures::future::join_all(
            device_ids.iter().map(|device_id| self.disconnect(device_id)),
        )
        .await;
        for (device_id, result) in device_ids.iter().zip(results) {
            if let Err(e) = result {
                debug!("Shutdown of {} skipped: {}", device_id, e);
            }
        }
    }

    fn commands(&self, device_id: &str) -> CoreResult<mpsc::Sender<Command>> {
        self.sessions
            .get(device_id)
            .map(|handle| handle.commands.clone())
            .ok_or_else(|| CamLinkError::SessionNotFound {
                device_id: device_id.to_string(),
            })
    }

    async fn request<T>(
        &self,
        device_id: &str,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> CoreResult<T> {
        let commands = self.commands(device_id)?;
        let (reply, response) = oneshot::channel();
        commands
            .send(command(reply))
            .await
            .map_err(|_| CamLinkError::SessionClosed {
                device_id: device_id.to_string(),
            })?;
        response.await.map_err(|_| CamLinkError::ConnectionLost {
            device_id: device_id.to_string(),
        })
    }

    fn spawn_session(&self, device_id: &str) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::channel(self.config.session.command_capacity);
        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let (pipeline_tx, pipeline_rx) = mpsc::unbounded_channel();

        let core = SessionCore::new(device_id, self.config.clone());
        let session_id = core.snapshot().session_id;
        let actor = SessionActor {
            core,
            config: self.config.clone(),
            backend: self.backend.clone(),
            sender: self.sender.clone(),
            events: self.events.clone(),
            pipeline: None,
            pipeline_tx,
        };
        info!("New session {} for device {}", session_id, device_id);

        let task = tokio::spawn(actor.run(commands_rx, pipeline_rx, disconnect_rx));
        SessionHandle {
            session_id,
            commands: commands_tx,
            disconnect: disconnect_tx,
            task,
        }
    }
}

/// Owns one session and executes the actions it decides on
struct SessionActor {
    core: SessionCore,
    config: BridgeConfig,
    backend: Arc<dyn MediaBackend>,
    sender: Arc<dyn PacketSender>,
    events: broadcast::Sender<SessionEvent>,
    pipeline: Option<MediaPipeline>,
    pipeline_tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut pipeline_events: mpsc::UnboundedReceiver<PipelineEvent>,
        mut disconnect: oneshot::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.config.session.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = &mut disconnect => break,

                Some(event) = pipeline_events.recv() => {
                    if event.generation != self.core.generation() {
                        debug!("Ignoring event from retired pipeline {}", event.generation);
                        continue;
                    }
                    let actions = self.core.on_pipeline_event(event.kind, Instant::now());
                    self.execute(actions).await;
                }

                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    // registry dropped without a disconnect
                    None => break,
                },

                _ = ticker.tick() => {
                    if let Some(pipeline) = &self.pipeline {
                        self.core.update_media_stats(&pipeline.stats());
                    }
                    let actions = self.core.tick(Instant::now());
                    self.execute(actions).await;
                }
            }
        }

        let actions = self.core.disconnect();
        self.execute(actions).await;
        debug!("Session actor for {} stopped", self.core.device_id());
    }

    async fn handle(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Inbound(inbound) => {
                let actions = self.core.on_inbound(inbound, now);
                self.execute(actions).await;
            }
            Command::Start { request, reply } => {
                let result = self.core.start(&request, now);
                let _ = reply.send(self.finish(result).await);
            }
            Command::Stop { reply } => {
                let result = self.core.stop(now).map(|actions| ((), actions));
                let _ = reply.send(self.finish(result).await);
            }
            Command::ChangeSettings { settings, reply } => {
                let result = self.core.change_settings(&settings);
                let _ = reply.send(self.finish(result).await);
            }
            Command::RequestKeyframe { reply } => {
                let result = self.core.request_keyframe().map(|actions| ((), actions));
                let _ = reply.send(self.finish(result).await);
            }
            Command::Snapshot { reply } => {
                if let Some(pipeline) = &self.pipeline {
                    self.core.update_media_stats(&pipeline.stats());
                }
                let _ = reply.send(self.core.snapshot());
            }
        }
    }

    async fn finish<T>(&mut self, result: CoreResult<(T, Vec<SessionAction>)>) -> CoreResult<T> {
        let (value, actions) = result?;
        self.execute(actions).await;
        Ok(value)
    }

    async fn execute(&mut self, actions: Vec<SessionAction>) {
        let mut queue: VecDeque<SessionAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                SessionAction::Send(packet) => {
                    let device_id = self.core.device_id().to_string();
                    if let Err(e) = self.sender.send_packet(&device_id, packet).await {
                        warn!("Failed to send packet to {}: {}", device_id, e);
                    }
                }
                SessionAction::SpawnPipeline { generation } => {
                    self.release_pipeline().await;
                    match MediaPipeline::spawn(
                        generation,
                        self.backend.clone(),
                        self.config.decode.clone(),
                        self.config.writer.clone(),
                        self.pipeline_tx.clone(),
                    ) {
                        Ok(pipeline) => self.pipeline = Some(pipeline),
                        Err(e) => {
                            error!("Failed to start media pipeline: {}", e);
                            let kind = PipelineEventKind::SinkFailed {
                                reason: e.to_string(),
                            };
                            queue.extend(self.core.on_pipeline_event(kind, Instant::now()));
                        }
                    }
                }
                SessionAction::Forward(frame) => {
                    if let Some(pipeline) = &self.pipeline {
                        let frame_type = frame.frame_type;
                        let outcome = pipeline.submit(frame);
                        queue.extend(self.core.on_submit_outcome(
                            frame_type,
                            outcome,
                            Instant::now(),
                        ));
                    }
                }
                SessionAction::ReleasePipeline => self.release_pipeline().await,
                SessionAction::Emit(kind) => {
                    let _ = self.events.send(SessionEvent {
                        device_id: self.core.device_id().to_string(),
                        kind,
                    });
                }
            }
        }
    }

    async fn release_pipeline(&mut self) {
        let Some(mut pipeline) = self.pipeline.take() else {
            return;
        };
        let released = tokio::task::spawn_blocking(move || {
            pipeline.release();
            pipeline.stats()
        })
        .await;
        match released {
            Ok(stats) => self.core.retire_media_stats(&stats),
            Err(e) => error!("Media pipeline release failed: {}", e),
        }
    }
}
