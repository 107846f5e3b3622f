use super::consumer::{CompletionCues, RecordingConsumer};
use super::types::{RecorderCommand, RecorderStatus, RecordingMode, StopReason, UserInfo};
use crate::config::EyecapConfig;
use crate::error::{EyecapError, Result};
use crate::events::EventBus;
use crate::reconnect::{ReconnectPolicy, ReconnectSupervisor};
use crate::stages::{CuePlayer, EventCuePlayer, StagePlan};
use crate::stream::{DeviceStreamClient, StreamEndpoint};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Wires the stream client, reconnect supervisor and recording pipeline
/// together and exposes the operator-facing controls.
pub struct Recorder {
    event_bus: Arc<EventBus>,
    client: DeviceStreamClient,
    supervisor: ReconnectSupervisor<DeviceStreamClient>,
    commands: mpsc::UnboundedSender<RecorderCommand>,
    consumer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Recorder {
    /// Build the recorder and start its consumer task. Must be called
    /// within a tokio runtime.
    pub fn new(config: EyecapConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| EyecapError::system("recorder requires a tokio runtime"))?;

        config.validate()?;

        let plan = match &config.stages.plan {
            Some(stages) => StagePlan::new(stages.clone())?,
            None => StagePlan::eye_capture_default(),
        };

        let event_bus = Arc::new(EventBus::new(config.system.event_bus_capacity));
        let client = DeviceStreamClient::new(config.device.clone(), Arc::clone(&event_bus));
        let supervisor = ReconnectSupervisor::new(
            client.clone(),
            ReconnectPolicy::from(&config.reconnect),
            Arc::clone(&event_bus),
        );

        let (commands, receiver) = mpsc::unbounded_channel();
        wire_observers(&client, &supervisor, &commands);

        let cues: Arc<dyn CuePlayer> = Arc::new(CompletionCues::new(
            Arc::new(EventCuePlayer::new(
                Arc::clone(&event_bus),
                config.stages.audible_cues,
            )),
            commands.clone(),
        ));

        let consumer = RecordingConsumer::new(
            config,
            plan,
            supervisor.clone(),
            Arc::clone(&event_bus),
            cues,
        );
        let handle = runtime.spawn(consumer.run(receiver));

        Ok(Self {
            event_bus,
            client,
            supervisor,
            commands,
            consumer: parking_lot::Mutex::new(Some(handle)),
        })
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.event_bus)
    }

    pub fn client(&self) -> &DeviceStreamClient {
        &self.client
    }

    /// Point the client at `address` and start connecting
    pub fn connect(&self, address: &str) -> Result<Vec<StreamEndpoint>> {
        let endpoints = self.client.configure(address)?;
        self.supervisor.connect()?;
        Ok(endpoints)
    }

    /// Stop and package any active (or still unpackaged) recording, then
    /// drop the device connection
    pub async fn disconnect(&self) -> Result<Option<PathBuf>> {
        let archive = self.stop_with(StopReason::Requested).await;
        self.supervisor.disconnect();
        let archive = archive?;
        info!("Disconnected from device");
        Ok(archive)
    }

    /// Open a new session folder and begin saving frames
    pub async fn start_recording(&self, user: UserInfo, mode: RecordingMode) -> Result<PathBuf> {
        let (reply, response) = oneshot::channel();
        self.send(RecorderCommand::StartRecording { user, mode, reply })?;
        response.await.map_err(|_| consumer_gone())?
    }

    /// Save the latest frame into the active session
    pub async fn capture_now(&self) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.send(RecorderCommand::CaptureNow { reply })?;
        response.await.map_err(|_| consumer_gone())
    }

    /// Stop recording and package the session. Returns the archive path,
    /// or `None` when nothing was captured. With no active recording this
    /// retries every previously failed packaging.
    pub async fn stop_recording(&self) -> Result<Option<PathBuf>> {
        self.stop_with(StopReason::Requested).await
    }

    pub async fn status(&self) -> Result<RecorderStatus> {
        let (reply, response) = oneshot::channel();
        self.send(RecorderCommand::Status {
            connection: self.client.connection_info(),
            reply,
        })?;
        response.await.map_err(|_| consumer_gone())
    }

    /// Finish any recording, drop the connection and stop the consumer task
    pub async fn shutdown(&self) {
        info!("Shutting down recorder");
        self.supervisor.begin_teardown();

        let _ = self.commands.send(RecorderCommand::Shutdown);
        let handle = self.consumer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Recording consumer ended abnormally: {}", e);
            }
        }

        self.client.stop();
        self.supervisor.finish_teardown();
        debug!("Recorder shutdown complete");
    }

    async fn stop_with(&self, reason: StopReason) -> Result<Option<PathBuf>> {
        let (reply, response) = oneshot::channel();
        self.send(RecorderCommand::StopRecording {
            reason,
            reply: Some(reply),
        })?;
        response.await.map_err(|_| consumer_gone())?
    }

    fn send(&self, command: RecorderCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| consumer_gone())
    }
}

fn consumer_gone() -> EyecapError {
    EyecapError::component("recorder", "recording consumer is not running")
}

/// Route client and supervisor notifications into the consumer queue
fn wire_observers(
    client: &DeviceStreamClient,
    supervisor: &ReconnectSupervisor<DeviceStreamClient>,
    commands: &mpsc::UnboundedSender<RecorderCommand>,
) {
    let tx = commands.clone();
    client.on_frame(move |frame| {
        let _ = tx.send(RecorderCommand::Frame(frame.clone()));
    });

    let tx = commands.clone();
    client.on_connected(move |_endpoint| {
        let _ = tx.send(RecorderCommand::Connected);
    });

    let tx = commands.clone();
    client.on_disconnected(move |reason| {
        if reason.is_unexpected() {
            let _ = tx.send(RecorderCommand::LinkLost);
        }
    });

    let tx = commands.clone();
    client.on_connect_failed(move |_attempted| {
        let _ = tx.send(RecorderCommand::LinkLost);
    });

    let tx = commands.clone();
    supervisor.on_give_up(move || {
        let _ = tx.send(RecorderCommand::ReconnectGaveUp);
    });
}
