use super::endpoint::{normalize_address, StreamEndpoint};
use super::watchdog::Watchdog;
use super::ConnectionState;
use crate::config::DeviceConfig;
use crate::error::{DecodeError, StreamError};
use crate::events::{EventBus, EyecapEvent};
use crate::frame::{Frame, FrameDecoder};
use crate::status::{status_summary, StatusEvent, StatusMessageParser};
use chrono::{DateTime, Local};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type FrameObserver = Arc<dyn Fn(&Frame) + Send + Sync>;
type StatusObserver = Arc<dyn Fn(&StatusEvent) + Send + Sync>;
type ConnectedObserver = Arc<dyn Fn(&StreamEndpoint) + Send + Sync>;
type DisconnectedObserver = Arc<dyn Fn(DisconnectReason) + Send + Sync>;
type ErrorObserver = Arc<dyn Fn(&str) + Send + Sync>;
type ConnectFailedObserver = Arc<dyn Fn(&[String]) + Send + Sync>;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Why a live connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The device closed the socket
    RemoteClosed,
    /// Transport error, with its message
    Failed(String),
    /// `stop()` was called
    Stopped,
}

impl DisconnectReason {
    pub fn is_unexpected(&self) -> bool {
        !matches!(self, DisconnectReason::Stopped)
    }
}

/// Snapshot of the client for status displays
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub url: Option<String>,
    pub state: ConnectionState,
    pub frames_received: u64,
    pub last_frame_time: Option<DateTime<Local>>,
    pub has_current_image: bool,
    pub battery: Option<f32>,
    pub brightness: Option<i32>,
}

#[derive(Default)]
struct Observers {
    frame: Vec<FrameObserver>,
    status: Vec<StatusObserver>,
    connected: Vec<ConnectedObserver>,
    disconnected: Vec<DisconnectedObserver>,
    error: Vec<ErrorObserver>,
    connect_failed: Vec<ConnectFailedObserver>,
}

/// Ownership of the current connection attempt. `generation` is bumped by
/// every start/stop so a finished task can tell it is stale.
#[derive(Default)]
struct Link {
    state: ConnectionState,
    generation: u64,
    endpoint: Option<StreamEndpoint>,
    cancel: Option<CancellationToken>,
    commands: Option<mpsc::UnboundedSender<Message>>,
}

#[derive(Default)]
struct Telemetry {
    frames_received: u64,
    connected_at: Option<Instant>,
    last_frame_at: Option<Instant>,
    last_frame_time: Option<DateTime<Local>>,
    battery: Option<f32>,
    brightness: Option<i32>,
}

enum LoopExit {
    Cancelled,
    RemoteClosed,
    Failed(String),
}

struct ClientShared {
    config: DeviceConfig,
    event_bus: Arc<EventBus>,
    decoder: FrameDecoder,
    parser: StatusMessageParser,
    endpoints: RwLock<Vec<StreamEndpoint>>,
    link: Mutex<Link>,
    current_image: RwLock<Option<Frame>>,
    telemetry: Mutex<Telemetry>,
    observers: RwLock<Observers>,
}

/// WebSocket client for the device image stream.
///
/// Binary messages are decoded into frames, text messages into status
/// events. Cloning is cheap and all clones drive the same connection.
#[derive(Clone)]
pub struct DeviceStreamClient {
    shared: Arc<ClientShared>,
}

impl DeviceStreamClient {
    pub fn new(config: DeviceConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                config,
                event_bus,
                decoder: FrameDecoder::new(),
                parser: StatusMessageParser::new(),
                endpoints: RwLock::new(Vec::new()),
                link: Mutex::new(Link::default()),
                current_image: RwLock::new(None),
                telemetry: Mutex::new(Telemetry::default()),
                observers: RwLock::new(Observers::default()),
            }),
        }
    }

    /// Normalize `address` into the candidate list used by the next `start()`
    pub fn configure(&self, address: &str) -> Result<Vec<StreamEndpoint>, StreamError> {
        let endpoints = normalize_address(
            address,
            &self.shared.config.default_path,
            self.shared.config.device_type,
        )?;

        info!(
            "Configured {} stream candidates: {}",
            endpoints.len(),
            endpoints
                .iter()
                .map(StreamEndpoint::url)
                .collect::<Vec<_>>()
                .join(", ")
        );

        *self.shared.endpoints.write() = endpoints.clone();
        Ok(endpoints)
    }

    pub fn endpoints(&self) -> Vec<StreamEndpoint> {
        self.shared.endpoints.read().clone()
    }

    /// Begin connecting in the background. A no-op while a connection is
    /// being attempted or is live.
    pub fn start(&self) -> Result<(), StreamError> {
        let endpoints = self.endpoints();
        if endpoints.is_empty() {
            return Err(StreamError::NotConfigured);
        }
        let runtime = Handle::try_current().map_err(|_| StreamError::NoRuntime)?;

        let (generation, cancel) = {
            let mut link = self.shared.link.lock();
            if matches!(
                link.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                warn!("Stream client already {}, ignoring start", link.state);
                return Ok(());
            }

            link.generation += 1;
            link.state = ConnectionState::Connecting;
            link.endpoint = None;
            let cancel = CancellationToken::new();
            link.cancel = Some(cancel.clone());
            (link.generation, cancel)
        };

        self.shared.publish_state(ConnectionState::Connecting, None);
        runtime.spawn(run_connection(
            Arc::clone(&self.shared),
            generation,
            endpoints,
            cancel,
        ));

        Ok(())
    }

    /// Drop the connection. Safe in any state and idempotent.
    pub fn stop(&self) {
        let (previous, cancel) = {
            let mut link = self.shared.link.lock();
            let previous = link.state;
            link.generation += 1;
            link.state = ConnectionState::Disconnected;
            link.endpoint = None;
            link.commands = None;
            (previous, link.cancel.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        *self.shared.current_image.write() = None;

        if previous != ConnectionState::Disconnected {
            info!("Stream client stopped (was {})", previous);
            self.shared
                .publish_state(ConnectionState::Disconnected, None);
        }
        if previous == ConnectionState::Connected {
            self.shared.notify_disconnected(DisconnectReason::Stopped);
        }
    }

    /// Flag a pending reconnect. Only meaningful while disconnected.
    pub fn mark_reconnecting(&self) {
        let changed = {
            let mut link = self.shared.link.lock();
            if link.state == ConnectionState::Disconnected {
                link.state = ConnectionState::Reconnecting;
                true
            } else {
                false
            }
        };

        if changed {
            self.shared
                .publish_state(ConnectionState::Reconnecting, None);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.link.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Most recent successfully decoded frame
    pub fn get_current_image(&self) -> Option<Frame> {
        self.shared.current_image.read().clone()
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        let (state, url) = {
            let link = self.shared.link.lock();
            (
                link.state,
                link.endpoint.as_ref().map(|e| e.url().to_string()),
            )
        };
        let telemetry = self.shared.telemetry.lock();

        ConnectionInfo {
            url,
            state,
            frames_received: telemetry.frames_received,
            last_frame_time: telemetry.last_frame_time,
            has_current_image: self.shared.current_image.read().is_some(),
            battery: telemetry.battery,
            brightness: telemetry.brightness,
        }
    }

    /// Queue a JSON command for the device. Returns false when not connected.
    pub fn send_command(&self, command: &serde_json::Value) -> bool {
        let link = self.shared.link.lock();
        let sender = match (&link.state, &link.commands) {
            (ConnectionState::Connected, Some(sender)) => sender,
            _ => {
                warn!("Device not connected, cannot send command");
                return false;
            }
        };

        match sender.send(Message::Text(command.to_string())) {
            Ok(()) => {
                debug!("Queued device command: {}", command);
                true
            }
            Err(e) => {
                error!("Failed to queue device command: {}", e);
                false
            }
        }
    }

    pub fn on_frame<F>(&self, observer: F)
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.shared.observers.write().frame.push(Arc::new(observer));
    }

    pub fn on_status<F>(&self, observer: F)
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.shared.observers.write().status.push(Arc::new(observer));
    }

    pub fn on_connected<F>(&self, observer: F)
    where
        F: Fn(&StreamEndpoint) + Send + Sync + 'static,
    {
        self.shared
            .observers
            .write()
            .connected
            .push(Arc::new(observer));
    }

    pub fn on_disconnected<F>(&self, observer: F)
    where
        F: Fn(DisconnectReason) + Send + Sync + 'static,
    {
        self.shared
            .observers
            .write()
            .disconnected
            .push(Arc::new(observer));
    }

    pub fn on_error<F>(&self, observer: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared.observers.write().error.push(Arc::new(observer));
    }

    /// Called with every attempted URL once all candidates have failed
    pub fn on_connect_failed<F>(&self, observer: F)
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        self.shared
            .observers
            .write()
            .connect_failed
            .push(Arc::new(observer));
    }
}

impl ClientShared {
    fn publish_state(&self, state: ConnectionState, endpoint: Option<String>) {
        let _ = self
            .event_bus
            .publish(EyecapEvent::ConnectionStateChanged { state, endpoint });
    }

    /// Returns false if this attempt was superseded by stop()/start()
    fn mark_connected(
        &self,
        generation: u64,
        endpoint: &StreamEndpoint,
        commands: mpsc::UnboundedSender<Message>,
    ) -> bool {
        {
            let mut link = self.link.lock();
            if link.generation != generation {
                return false;
            }
            link.state = ConnectionState::Connected;
            link.endpoint = Some(endpoint.clone());
            link.commands = Some(commands);
        }
        {
            let mut telemetry = self.telemetry.lock();
            telemetry.connected_at = Some(Instant::now());
            telemetry.last_frame_at = None;
        }

        info!("Connected to device stream at {}", endpoint);
        self.publish_state(ConnectionState::Connected, Some(endpoint.url().to_string()));

        let observers = self.observers.read().connected.clone();
        for observer in observers {
            observer(endpoint);
        }
        true
    }

    fn handle_loop_exit(&self, generation: u64, exit: LoopExit) {
        let reason = match exit {
            LoopExit::Cancelled => return,
            LoopExit::RemoteClosed => DisconnectReason::RemoteClosed,
            LoopExit::Failed(message) => DisconnectReason::Failed(message),
        };

        {
            let mut link = self.link.lock();
            if link.generation != generation {
                return;
            }
            link.state = ConnectionState::Disconnected;
            link.endpoint = None;
            link.commands = None;
            link.cancel = None;
        }

        warn!("Device stream disconnected: {:?}", reason);
        self.publish_state(ConnectionState::Disconnected, None);
        self.notify_disconnected(reason.clone());

        if let DisconnectReason::Failed(message) = reason {
            let _ = self.event_bus.publish(EyecapEvent::StreamError {
                message: message.clone(),
            });
            let observers = self.observers.read().error.clone();
            for observer in observers {
                observer(&message);
            }
        }
    }

    fn handle_connect_failed(&self, generation: u64, attempted: Vec<String>) {
        {
            let mut link = self.link.lock();
            if link.generation != generation {
                return;
            }
            link.state = ConnectionState::Disconnected;
            link.cancel = None;
        }

        error!("{}", StreamError::ConnectFailed {
            attempted: attempted.clone()
        });
        self.publish_state(ConnectionState::Disconnected, None);
        let _ = self.event_bus.publish(EyecapEvent::ConnectFailed {
            attempted: attempted.clone(),
        });

        let observers = self.observers.read().connect_failed.clone();
        for observer in observers {
            observer(&attempted);
        }
    }

    fn notify_disconnected(&self, reason: DisconnectReason) {
        let observers = self.observers.read().disconnected.clone();
        for observer in observers {
            observer(reason.clone());
        }
    }

    fn handle_binary(&self, data: &[u8]) {
        let frame = match self.decoder.decode(data) {
            Ok(frame) => frame,
            Err(e @ DecodeError::TooSmall { .. }) => {
                debug!("Dropping frame: {}", e);
                return;
            }
            Err(e) => {
                warn!("Dropping frame: {}", e);
                return;
            }
        };

        *self.current_image.write() = Some(frame.clone());
        {
            let mut telemetry = self.telemetry.lock();
            telemetry.frames_received += 1;
            telemetry.last_frame_at = Some(frame.received_at);
            telemetry.last_frame_time = Some(Local::now());
            trace!("Frame #{} received", telemetry.frames_received);
        }

        let observers = self.observers.read().frame.clone();
        for observer in observers {
            observer(&frame);
        }
    }

    fn handle_text(&self, text: &str) {
        let events = self.parser.parse(text);
        if events.is_empty() {
            return;
        }

        let summary = {
            let mut telemetry = self.telemetry.lock();
            for event in &events {
                match event {
                    StatusEvent::BatteryLevel(level) => telemetry.battery = Some(*level),
                    StatusEvent::BrightnessLevel(level) => telemetry.brightness = Some(*level),
                    StatusEvent::FreeText(_) => {}
                }
            }
            status_summary(telemetry.battery, telemetry.brightness)
        };
        if let Some(summary) = summary {
            debug!("Device status: {}", summary);
        }

        let observers = self.observers.read().status.clone();
        for event in events {
            for observer in &observers {
                observer(&event);
            }
            let _ = self.event_bus.publish(EyecapEvent::Status(event));
        }
    }

    fn last_activity(&self) -> Option<Instant> {
        let telemetry = self.telemetry.lock();
        telemetry.last_frame_at.or(telemetry.connected_at)
    }

    fn report_silence(&self, silent_for: Duration) {
        let warning = StatusEvent::FreeText(format!(
            "Warning: no image data received for {}s",
            silent_for.as_secs()
        ));

        let observers = self.observers.read().status.clone();
        for observer in &observers {
            observer(&warning);
        }
        let _ = self.event_bus.publish(EyecapEvent::WatchdogSilence {
            silent_for_secs: silent_for.as_secs(),
        });
    }
}

async fn run_connection(
    shared: Arc<ClientShared>,
    generation: u64,
    endpoints: Vec<StreamEndpoint>,
    cancel: CancellationToken,
) {
    let connect_timeout = shared.config.connect_timeout();
    let mut attempted = Vec::with_capacity(endpoints.len());

    for endpoint in endpoints {
        attempted.push(endpoint.url().to_string());
        info!("Connecting to {}", endpoint);

        let attempt = tokio::time::timeout(connect_timeout, connect_async(endpoint.url()));
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Connection attempt to {} cancelled", endpoint);
                return;
            }
            result = attempt => result,
        };

        let stream = match result {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                warn!("Connection to {} failed: {}", endpoint, e);
                continue;
            }
            Err(_) => {
                warn!(
                    "{}",
                    StreamError::ConnectTimeout {
                        url: endpoint.url().to_string(),
                        timeout_secs: connect_timeout.as_secs(),
                    }
                );
                continue;
            }
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        if !shared.mark_connected(generation, &endpoint, command_tx) {
            debug!("Connection to {} superseded, closing", endpoint);
            return;
        }

        let watchdog_cancel = cancel.child_token();
        let watchdog = Watchdog::new(
            shared.config.watchdog_silence(),
            shared.config.watchdog_check_interval(),
        );
        let activity = Arc::clone(&shared);
        let silence = Arc::clone(&shared);
        tokio::spawn(watchdog.run(
            move || activity.last_activity(),
            move |silent_for| silence.report_silence(silent_for),
            watchdog_cancel.clone(),
        ));

        let exit = receive_loop(&shared, stream, command_rx, &cancel).await;
        watchdog_cancel.cancel();
        shared.handle_loop_exit(generation, exit);
        return;
    }

    shared.handle_connect_failed(generation, attempted);
}

/// Read messages until the socket ends or the connection is cancelled.
/// There is no read timeout: devices may pause for a while without being
/// dead, and the client never sends keep-alive pings of its own.
async fn receive_loop(
    shared: &ClientShared,
    stream: WsStream,
    mut commands: mpsc::UnboundedReceiver<Message>,
    cancel: &CancellationToken,
) -> LoopExit {
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
                return LoopExit::Cancelled;
            }
            Some(command) = commands.recv() => {
                if let Err(e) = sink.send(command).await {
                    return LoopExit::Failed(e.to_string());
                }
            }
            message = source.next() => match message {
                Some(Ok(Message::Binary(data))) => shared.handle_binary(&data),
                Some(Ok(Message::Text(text))) => shared.handle_text(&text),
                Some(Ok(Message::Close(frame))) => {
                    debug!("Device closed the stream: {:?}", frame);
                    return LoopExit::RemoteClosed;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return LoopExit::Failed(e.to_string()),
                None => return LoopExit::RemoteClosed,
            },
        }
    }
}
