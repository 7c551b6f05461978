//! Owns the upstream gateway WebSocket session: authenticating the
//! handshake, reading frames, answering pings, detecting zombie sessions,
//! and re-establishing the connection with backoff when it drops.
//! Decoded events pass through duplicate suppression before being handed
//! to the bounded queue via an unbounded channel (the queue applies the
//! actual bound; the channel just decouples the reader from the consumer).

use crate::config::Configuration;
use crate::decode;
use crate::dedup::DedupCache;
use crate::event::RewardEvent;
use crate::shutdown;
use crate::util;
use futures::{SinkExt, StreamExt};
use relay_config_backoff::ReconnectionState;
use slog::Logger;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code sent by the upstream when the presented API key is invalid
const CLOSE_INVALID_KEY: u16 = 4002;
/// Close code sent by the upstream when the API key is already in use
/// by another session
const CLOSE_KEY_IN_USE: u16 = 4003;

/// Observable lifecycle of the upstream gateway connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
    Streaming,
    Degraded,
    Reconnecting,
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Authentication failures are fatal: retrying with the same key
    /// would loop forever, and with 4003 it would fight the other session
    #[error("upstream gateway rejected authentication: {reason}")]
    Auth { code: Option<u16>, reason: String },
    #[error("transport-level gateway failure")]
    Transport(#[source] anyhow::Error),
    #[error(transparent)]
    BackoffExhausted(#[from] relay_config_backoff::BackoffExhausted),
}

/// Performs the WebSocket handshake against the configured upstream,
/// presenting the API key as a request header
pub async fn open_session(config: &Configuration) -> Result<WsStream, SessionError> {
    let mut request = config
        .services
        .upstream_gateway
        .as_str()
        .into_client_request()
        .map_err(|err| SessionError::Transport(err.into()))?;
    let token = HeaderValue::from_str(&config.secrets.api_token).map_err(|err| {
        SessionError::Auth {
            code: None,
            reason: format!("API key is not a valid header value: {}", err),
        }
    })?;
    request.headers_mut().insert("api-key", token);

    match connect_async(request).await {
        Ok((ws, _response)) => Ok(ws),
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                Err(SessionError::Auth {
                    code: Some(status.as_u16()),
                    reason: format!("handshake rejected with HTTP {}", status),
                })
            } else {
                Err(SessionError::Transport(anyhow::anyhow!(
                    "handshake failed with HTTP {}",
                    status
                )))
            }
        }
        Err(err) => Err(SessionError::Transport(err.into())),
    }
}

/// Why an individual session stopped streaming
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    AuthRejected { code: u16, reason: String },
    Zombie,
    Closed { code: Option<u16>, reason: String },
    Transport(anyhow::Error),
    ConsumerGone,
}

/// Long-running reader for the upstream gateway connection.
/// Consumes itself in `run` and emits deduplicated events
/// on the paired stream handed out by `new`.
pub struct StreamConnection {
    config: Arc<Configuration>,
    logger: Logger,
    dedup: DedupCache,
    state: ConnectionState,
    event_tx: mpsc::UnboundedSender<RewardEvent>,
}

impl StreamConnection {
    pub fn new(
        config: Arc<Configuration>,
        logger: &Logger,
        dedup: DedupCache,
    ) -> (Self, UnboundedReceiverStream<RewardEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let new_self = Self {
            config,
            logger: logger.new(slog::o!("component" => "gateway")),
            dedup,
            state: ConnectionState::Disconnected,
            event_tx,
        };
        (new_self, UnboundedReceiverStream::new(event_rx))
    }

    /// Streams events from the initial session and every reconnected
    /// session after it, until shutdown or a fatal error.
    /// Dropping the paired event stream also ends the reader.
    pub async fn run(
        mut self,
        initial: WsStream,
        mut shutdown: shutdown::Receiver,
    ) -> Result<(), SessionError> {
        let mut reconnection = ReconnectionState::new(
            self.config.reconnection_backoff.build(),
            self.config.reconnection_backoff_reset_threshold,
        );
        // Marks the initial session's start so the first reconnect
        // is judged against it
        reconnection.next_delay()?;

        let mut session = Some(initial);
        loop {
            let ws = match session.take() {
                Some(ws) => ws,
                None => {
                    self.set_state(ConnectionState::Reconnecting);
                    if let Some(delay) = reconnection.next_delay()? {
                        slog::info!(
                            self.logger,
                            "waiting before reconnecting to upstream gateway";
                            "delay" => ?delay,
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {},
                            _ = shutdown.recv() => break,
                        }
                    }
                    if shutdown.is_triggered() {
                        break;
                    }

                    self.set_state(ConnectionState::Connecting);
                    match open_session(&self.config).await {
                        Ok(ws) => ws,
                        Err(err @ SessionError::Auth { .. }) => {
                            self.set_state(ConnectionState::Disconnected);
                            return Err(err);
                        }
                        Err(err) => {
                            slog::warn!(
                                self.logger,
                                "connecting to upstream gateway failed; will retry";
                                "error" => ?err,
                            );
                            self.set_state(ConnectionState::Degraded);
                            continue;
                        }
                    }
                }
            };

            self.set_state(ConnectionState::Authenticated);
            match self.stream_session(ws, &mut shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::ConsumerGone => {
                    slog::info!(
                        self.logger,
                        "downstream event consumer is gone; gateway reader exiting",
                    );
                    break;
                }
                SessionEnd::AuthRejected { code, reason } => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(SessionError::Auth {
                        code: Some(code),
                        reason,
                    });
                }
                end => {
                    slog::warn!(
                        self.logger,
                        "upstream gateway session ended; reconnecting";
                        "session_end" => ?end,
                    );
                    self.set_state(ConnectionState::Degraded);
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// Reads one session to its end, answering pings and enforcing the
    /// zombie timeout between inbound frames
    async fn stream_session(
        &mut self,
        mut ws: WsStream,
        shutdown: &mut shutdown::Receiver,
    ) -> SessionEnd {
        loop {
            let next = tokio::select! {
                _ = shutdown.recv() => {
                    let _ = ws.close(None).await;
                    return SessionEnd::Shutdown;
                },
                next = tokio::time::timeout(self.config.zombie_timeout, ws.next()) => next,
            };

            let message = match next {
                Err(_elapsed) => return SessionEnd::Zombie,
                Ok(None) => {
                    return SessionEnd::Closed {
                        code: None,
                        reason: String::from("connection ended without a close frame"),
                    }
                }
                Ok(Some(Err(err))) => return SessionEnd::Transport(err.into()),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(raw) => {
                    self.set_state(ConnectionState::Streaming);
                    if !self.ingest_frame(&raw) {
                        return SessionEnd::ConsumerGone;
                    }
                }
                Message::Ping(payload) => {
                    if let Err(err) = ws.send(Message::Pong(payload)).await {
                        return SessionEnd::Transport(err.into());
                    }
                }
                Message::Close(frame) => {
                    return match frame {
                        Some(frame) => {
                            let code = u16::from(frame.code);
                            let reason = frame.reason.into_owned();
                            if code == CLOSE_INVALID_KEY || code == CLOSE_KEY_IN_USE {
                                SessionEnd::AuthRejected { code, reason }
                            } else {
                                SessionEnd::Closed {
                                    code: Some(code),
                                    reason,
                                }
                            }
                        }
                        None => SessionEnd::Closed {
                            code: None,
                            reason: String::new(),
                        },
                    };
                }
                // Pong, Binary, and raw frames carry nothing we consume
                _ => {}
            }
        }
    }

    /// Decodes one text frame and forwards its non-duplicate events.
    /// Returns false once the receiving side of the event stream is gone.
    fn ingest_frame(&mut self, raw: &str) -> bool {
        let decoded = match decode::decode_frame(raw, util::millisecond_ts()) {
            Ok(decoded) => decoded,
            Err(err) => {
                err.log(&self.logger);
                return true;
            }
        };
        for err in &decoded.errors {
            err.log(&self.logger);
        }

        for event in decoded.events {
            if !self.dedup.accept(&event) {
                slog::debug!(
                    self.logger,
                    "suppressed duplicate reward event";
                    "username" => &event.username,
                    "reward" => &event.reward,
                );
                continue;
            }
            if self.event_tx.send(event).is_err() {
                return false;
            }
        }
        true
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            slog::info!(
                self.logger,
                "gateway connection state changed";
                "from" => ?self.state,
                "to" => ?next,
            );
            self.state = next;
        }
    }
}
