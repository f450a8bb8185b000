//! WebSocket connection lifecycle and command dispatch

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use mirai_config::HaConfig;
use mirai_core::normalize::normalize_ha;
use mirai_event_bus::{topics, SharedEventBus};

use crate::protocol::{
    auth_frame, classify, subscribe_events_frame, with_id, MessageIdAllocator, ServerMessage,
};

/// Handshake and read timeout during connection setup
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed delay between reconnect attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Outbound command queue depth
const COMMAND_QUEUE_DEPTH: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    AwaitingAuth,
    Authenticating,
    Subscribing,
    Ready,
    Backoff,
    /// Terminal: authentication was rejected, no reconnect
    Failed,
}

/// How a session ended
enum SessionEnd {
    /// Fatal: the token was rejected
    AuthInvalid,
    /// Transient: socket error, close, or protocol surprise
    Transport,
    /// The process is shutting down
    Shutdown,
}

/// Handle for submitting outbound commands
///
/// Cloneable and cheap; owned by every automation context. Commands
/// submitted while the connector is not READY are dropped with a warning,
/// never queued: automations are event-driven and a re-fired trigger will
/// reissue the call.
#[derive(Clone)]
pub struct CommandSender {
    commands: mpsc::Sender<Value>,
    state: watch::Receiver<ConnectorState>,
}

impl CommandSender {
    /// Current connector state
    pub fn state(&self) -> ConnectorState {
        *self.state.borrow()
    }

    /// Whether the connector is ready to send
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectorState::Ready
    }

    /// Submit a command payload, fire-and-forget
    ///
    /// The connector injects the message id before writing the frame.
    pub fn send_command(&self, payload: Value) {
        if !self.is_ready() {
            warn!(
                state = ?self.state(),
                "dropping service call: connector not ready"
            );
            return;
        }
        if let Err(e) = self.commands.try_send(payload) {
            warn!(error = %e, "dropping service call: command queue full");
        }
    }
}

/// The Home Assistant WebSocket connector
pub struct HaConnector {
    config: HaConfig,
    bus: SharedEventBus,
    cmd_rx: mpsc::Receiver<Value>,
    state_tx: watch::Sender<ConnectorState>,
}

impl HaConnector {
    /// Create the connector and its command handle
    ///
    /// Nothing connects until [`HaConnector::start`] is called.
    pub fn new(config: HaConfig, bus: SharedEventBus) -> (Self, CommandSender) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(ConnectorState::Disconnected);

        let connector = Self {
            config,
            bus,
            cmd_rx,
            state_tx,
        };
        let sender = CommandSender {
            commands: cmd_tx,
            state: state_rx,
        };
        (connector, sender)
    }

    /// Run the connection loop until shutdown or fatal auth failure
    pub fn start(mut self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let url = self.config.ws_url();
            loop {
                self.set_state(ConnectorState::Connecting);
                debug!(%url, "connecting to Home Assistant");

                match timeout(HANDSHAKE_TIMEOUT, connect_async(url.as_str())).await {
                    Ok(Ok((stream, _))) => match self.run_session(stream, &mut shutdown).await {
                        SessionEnd::AuthInvalid => {
                            self.set_state(ConnectorState::Failed);
                            error!("Home Assistant rejected the access token; not reconnecting");
                            return;
                        }
                        SessionEnd::Shutdown => {
                            self.set_state(ConnectorState::Disconnected);
                            return;
                        }
                        SessionEnd::Transport => {}
                    },
                    Ok(Err(e)) => warn!(error = %e, "websocket connect failed"),
                    Err(_) => warn!("websocket connect timed out"),
                }

                // Commands accepted while READY but never written die with
                // the session
                while self.cmd_rx.try_recv().is_ok() {
                    warn!("dropping service call: connection lost before send");
                }

                self.set_state(ConnectorState::Backoff);
                tokio::select! {
                    _ = sleep(RECONNECT_DELAY) => {}
                    _ = shutdown.recv() => {
                        self.set_state(ConnectorState::Disconnected);
                        return;
                    }
                }
            }
        })
    }

    /// Drive one authenticated session to its end
    async fn run_session(
        &mut self,
        stream: WsStream,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        self.set_state(ConnectorState::AwaitingAuth);
        match recv_json(&mut read).await {
            Ok(frame) if classify(&frame) == ServerMessage::AuthRequired => {}
            Ok(frame) => {
                warn!(?frame, "expected auth_required");
                return SessionEnd::Transport;
            }
            Err(e) => {
                warn!(error = %e, "handshake read failed");
                return SessionEnd::Transport;
            }
        }

        self.set_state(ConnectorState::Authenticating);
        if let Err(e) = send_json(&mut write, &auth_frame(&self.config.token)).await {
            warn!(error = %e, "failed to send auth");
            return SessionEnd::Transport;
        }

        match recv_json(&mut read).await {
            Ok(frame) => match classify(&frame) {
                ServerMessage::AuthOk => {}
                ServerMessage::AuthInvalid { message } => {
                    error!(%message, "authentication failed");
                    return SessionEnd::AuthInvalid;
                }
                other => {
                    warn!(?other, "unexpected frame during authentication");
                    return SessionEnd::Transport;
                }
            },
            Err(e) => {
                warn!(error = %e, "auth response read failed");
                return SessionEnd::Transport;
            }
        }

        // Fresh allocator per connection; subscribe_events consumes id 1
        let ids = MessageIdAllocator::new();

        self.set_state(ConnectorState::Subscribing);
        let subscribe_id = ids.next();
        let subscribe = subscribe_events_frame(subscribe_id, "state_changed");
        if let Err(e) = send_json(&mut write, &subscribe).await {
            warn!(error = %e, "failed to send subscription");
            return SessionEnd::Transport;
        }

        loop {
            match recv_json(&mut read).await {
                Ok(frame) => match classify(&frame) {
                    ServerMessage::Result {
                        id: Some(id),
                        success,
                        error,
                    } if id == subscribe_id => {
                        if success {
                            break;
                        }
                        warn!(?error, "event subscription rejected");
                        return SessionEnd::Transport;
                    }
                    other => debug!(?other, "frame before subscription ack"),
                },
                Err(e) => {
                    warn!(error = %e, "subscription ack read failed");
                    return SessionEnd::Transport;
                }
            }
        }

        self.set_state(ConnectorState::Ready);
        info!("connected to Home Assistant, subscribed to state_changed");

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(payload) = cmd else {
                        debug!("all command senders dropped");
                        return SessionEnd::Shutdown;
                    };
                    let id = ids.next();
                    let frame = with_id(payload, id);
                    match send_json(&mut write, &frame).await {
                        Ok(()) => debug!(id, "sent command frame"),
                        Err(e) => {
                            warn!(error = %e, "command write failed");
                            return SessionEnd::Transport;
                        }
                    }
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("server closed the connection");
                        return SessionEnd::Transport;
                    }
                    Some(Ok(_)) => {} // ping/pong/binary: nothing to do
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read error");
                        return SessionEnd::Transport;
                    }
                },
                _ = shutdown.recv() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    /// Dispatch one inbound text frame
    fn handle_frame(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "undecodable frame from Home Assistant");
                return;
            }
        };

        match classify(&frame) {
            ServerMessage::Event => {
                let event = normalize_ha(&frame);
                self.bus.publish(topics::HA_EVENTS, event);
            }
            ServerMessage::Result { id, success, error } => {
                if success {
                    debug!(?id, "command acknowledged");
                } else {
                    warn!(?id, ?error, "command rejected by Home Assistant");
                }
            }
            other => debug!(?other, "ignoring frame"),
        }
    }

    fn set_state(&self, state: ConnectorState) {
        debug!(?state, "connector state");
        let _ = self.state_tx.send(state);
    }
}

/// Read the next text frame as JSON, bounded by the handshake timeout
async fn recv_json(read: &mut WsSource) -> Result<Value, String> {
    let message = timeout(HANDSHAKE_TIMEOUT, read.next())
        .await
        .map_err(|_| "read timeout".to_string())?
        .ok_or_else(|| "connection closed".to_string())?
        .map_err(|e| e.to_string())?;

    match message {
        Message::Text(text) => serde_json::from_str(&text).map_err(|e| e.to_string()),
        other => Err(format!("unexpected message: {other:?}")),
    }
}

/// Write one JSON value as a text frame
async fn send_json(write: &mut WsSink, frame: &Value) -> Result<(), String> {
    write
        .send(Message::Text(frame.to_string()))
        .await
        .map_err(|e| e.to_string())
}
