//! Real-time event channel
//!
//! Holds one authenticated connection to the event endpoint, reconnects
//! with exponential backoff when it drops, and reports what happens as
//! [`ChannelSignal`]s. Every successful connect (including the first) is
//! followed by [`ChannelSignal::Resynced`] so the consumer can fetch a
//! snapshot covering whatever was missed.

pub mod state;
pub mod transport;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time;

use crate::auth::AuthService;
use crate::config::SyncSettings;
use crate::models::{ClientEvent, ServerEvent};

pub use state::{Backoff, ChannelState, Transition};
pub use transport::{ChannelError, Transport};
pub use websocket::WebSocketTransport;

/// What the channel reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    StateChanged(ChannelState),
    /// A connection was (re)established; events may have been missed.
    Resynced,
    Event(ServerEvent),
}

/// Why a connected session ended.
enum Exit {
    Shutdown,
    /// Server closed or the connection failed. Retry.
    Dropped(String),
    AuthRejected(String),
    /// The signal receiver is gone; nobody is listening.
    Detached,
}

/// One iteration of the connected loop.
enum Step {
    Frame(Result<Option<String>, ChannelError>),
    Outbound(ClientEvent),
    Shutdown,
}

pub struct EventChannel<T: Transport> {
    transport: T,
    auth: Arc<dyn AuthService>,
    backoff: Backoff,
    heartbeat: Duration,
    state: ChannelState,
    signals: mpsc::Sender<ChannelSignal>,
}

impl<T: Transport> EventChannel<T> {
    pub fn new(
        transport: T,
        auth: Arc<dyn AuthService>,
        settings: &SyncSettings,
        signals: mpsc::Sender<ChannelSignal>,
    ) -> Self {
        Self {
            transport,
            auth,
            backoff: Backoff {
                base: Duration::from_millis(settings.backoff_base_ms),
                factor: settings.backoff_factor,
                cap: Duration::from_millis(settings.backoff_cap_ms),
            },
            heartbeat: settings.heartbeat(),
            state: ChannelState::Disconnected,
            signals,
        }
    }

    /// Connect and keep the connection alive until `shutdown` flips to
    /// true (or its sender is dropped) or the credential is rejected.
    ///
    /// Frames queued on `outbound` while disconnected are sent after the
    /// next successful connect. Returns the final state.
    pub async fn run(
        mut self,
        mut outbound: mpsc::Receiver<ClientEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ChannelState {
        self.transition(Transition::Connect).await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let credential = match self.auth.get_credential() {
                Some(c) if self.auth.is_valid(&c) => c,
                Some(_) => {
                    tracing::warn!("Session credential is expired or malformed");
                    self.transition(Transition::AuthRejected).await;
                    return self.state;
                }
                None => {
                    tracing::warn!("No session credential. Run `chat-sync login` first.");
                    self.transition(Transition::AuthRejected).await;
                    return self.state;
                }
            };

            let connected = tokio::select! {
                r = self.transport.connect(&credential) => r,
                _ = shutdown.changed() => break,
            };

            match connected {
                Ok(()) => {
                    self.transition(Transition::Connected).await;
                    if !self.emit(ChannelSignal::Resynced).await {
                        break;
                    }
                    match self.pump(&mut outbound, &mut shutdown).await {
                        Exit::Shutdown | Exit::Detached => break,
                        Exit::AuthRejected(reason) => {
                            tracing::warn!("Event channel rejected credential: {}", reason);
                            self.transport.disconnect().await;
                            self.transition(Transition::AuthRejected).await;
                            return self.state;
                        }
                        Exit::Dropped(reason) => {
                            tracing::warn!("Event channel disconnected: {}", reason);
                            self.transport.disconnect().await;
                            self.transition(Transition::Dropped).await;
                        }
                    }
                }
                Err(ChannelError::Unauthenticated(reason)) => {
                    tracing::warn!("Event channel rejected credential: {}", reason);
                    self.transition(Transition::AuthRejected).await;
                    return self.state;
                }
                Err(e) => {
                    tracing::warn!("Event channel connect failed: {}", e);
                    self.transition(Transition::ConnectFailed).await;
                }
            }

            let attempt = match self.state {
                ChannelState::Reconnecting { attempt } => attempt,
                _ => 1,
            };
            let delay = self.backoff.delay(attempt);
            tracing::info!("Reconnecting in {:?} (attempt {})", delay, attempt);

            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.transport.disconnect().await;
        self.transition(Transition::Shutdown).await;
        self.state
    }

    /// Connected loop: forward frames, flush outbound events, heartbeat.
    async fn pump(
        &mut self,
        outbound: &mut mpsc::Receiver<ClientEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit {
        let mut heartbeat = time::interval_at(time::Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                frame = self.transport.recv() => Step::Frame(frame),
                Some(event) = outbound.recv() => Step::Outbound(event),
                _ = heartbeat.tick() => Step::Outbound(ClientEvent::Ping),
                _ = shutdown.changed() => Step::Shutdown,
            };

            match step {
                Step::Shutdown => return Exit::Shutdown,
                Step::Frame(Ok(Some(text))) => match ServerEvent::parse(&text) {
                    Ok(event) => {
                        tracing::debug!("Event: {}", event.name());
                        if !self.emit(ChannelSignal::Event(event)).await {
                            return Exit::Detached;
                        }
                    }
                    Err(e) => tracing::debug!("Skipping unrecognised frame ({}): {}", e, text),
                },
                Step::Frame(Ok(None)) => return Exit::Dropped("closed by server".into()),
                Step::Frame(Err(ChannelError::Unauthenticated(reason))) => {
                    return Exit::AuthRejected(reason)
                }
                Step::Frame(Err(e)) => return Exit::Dropped(e.to_string()),
                Step::Outbound(event) => {
                    let frame = match event.to_frame() {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!("Could not encode outbound event: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = self.transport.send(frame).await {
                        return Exit::Dropped(format!("send failed: {}", e));
                    }
                }
            }
        }
    }

    async fn transition(&mut self, input: Transition) {
        let next = self.state.next(input);
        if next != self.state {
            tracing::debug!("Channel {} -> {}", self.state.label(), next.label());
            self.state = next;
            self.emit(ChannelSignal::StateChanged(next)).await;
        }
    }

    /// Returns false once the consumer has gone away.
    async fn emit(&mut self, signal: ChannelSignal) -> bool {
        self.signals.send(signal).await.is_ok()
    }
}
