//! The connection task: one socket at a time, reconnecting with backoff.
//!
//! Each [`Connection`] runs on its own tokio task, which is the single
//! dispatch context for that endpoint. Frames are handed to the
//! [`EventDispatcher`] inline, in arrival order.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::dispatch::EventDispatcher;
use crate::error::{StreamError, StreamResult};
use crate::events::ConnectionEvent;
use crate::keepalive::{next_tick, Keepalive, KeepaliveAction};
use crate::reconnect::RetryState;
use crate::registry::SubscriptionRegistry;
use crate::state::{ConnectionState, ConnectionStateMachine};
use crate::transport::{CloseEvent, Endpoint, LifecycleEvent, TransportSocket, CLOSE_NORMAL};

/// Reason sent with the close frame on an intentional disconnect.
pub(crate) const CLIENT_DISCONNECT: &str = "client disconnect";

/// State shared between a facade and whichever task currently serves it.
///
/// Every task runs under an epoch. Starting or stopping a task bumps the
/// epoch, so a task that is still winding down can no longer touch the
/// status or publish events.
#[derive(Debug)]
pub(crate) struct ConnectionShared {
    state: ConnectionStateMachine,
    epoch: Mutex<u64>,
    events: broadcast::Sender<ConnectionEvent>,
    failure: Mutex<Option<StreamError>>,
}

impl ConnectionShared {
    pub(crate) fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            state: ConnectionStateMachine::new(),
            epoch: Mutex::new(0),
            events,
            failure: Mutex::new(None),
        }
    }

    pub(crate) const fn state(&self) -> &ConnectionStateMachine {
        &self.state
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn failure(&self) -> Option<StreamError> {
        self.failure.lock().clone()
    }

    /// Claim a fresh epoch for a new task and move to `Connecting`.
    fn begin(&self) -> StreamResult<u64> {
        let mut epoch = self.epoch.lock();
        self.state.transition(ConnectionState::Connecting)?;
        *epoch += 1;
        *self.failure.lock() = None;
        Ok(*epoch)
    }

    /// Retire the current epoch and settle in `Disconnected`.
    pub(crate) fn end(&self) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        let was = self.state.current();
        if let Err(e) = self.state.transition(ConnectionState::Disconnected) {
            debug!(error = %e, "ignoring transition on disconnect");
        }
        if was != ConnectionState::Disconnected {
            let _ = self.events.send(ConnectionEvent::Disconnected {
                code: CLOSE_NORMAL,
                reason: CLIENT_DISCONNECT.to_string(),
            });
        }
    }

    fn transition(&self, epoch: u64, to: ConnectionState) {
        let current = self.epoch.lock();
        if *current != epoch {
            return;
        }
        if let Err(e) = self.state.transition(to) {
            debug!(error = %e, "ignoring transition");
        }
    }

    fn emit(&self, epoch: u64, event: ConnectionEvent) {
        let current = self.epoch.lock();
        if *current == epoch {
            // No receivers is fine.
            let _ = self.events.send(event);
        }
    }

    fn fail(&self, epoch: u64, attempts: u32, reason: String) {
        let current = self.epoch.lock();
        if *current != epoch {
            return;
        }
        if let Err(e) = self.state.transition(ConnectionState::Error) {
            debug!(error = %e, "ignoring transition");
        }
        *self.failure.lock() = Some(StreamError::MaxRetriesExceeded {
            attempts,
            reason: reason.clone(),
        });
        let _ = self
            .events
            .send(ConnectionEvent::ReconnectFailed { attempts, reason });
    }
}

/// Owner's side of a running connection task.
///
/// Dropping the handle cancels the task.
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    task: JoinHandle<()>,
    outbound: mpsc::UnboundedSender<String>,
    cancel: DropGuard,
}

impl ConnectionHandle {
    /// Whether the task has exited on its own (retries exhausted).
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Queue a text frame for the current socket.
    pub(crate) fn send(&self, text: String) -> StreamResult<()> {
        self.outbound
            .send(text)
            .map_err(|_| StreamError::NotConnected)
    }

    /// Cancel the task and hand back its join handle.
    pub(crate) fn cancel(self) -> JoinHandle<()> {
        let Self { task, cancel, .. } = self;
        drop(cancel);
        task
    }
}

/// The connection task.
pub(crate) struct Connection {
    endpoint: Endpoint,
    config: StreamConfig,
    dispatcher: EventDispatcher,
    shared: Arc<ConnectionShared>,
    epoch: u64,
    outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
}

impl Connection {
    /// Start a connection task on the current runtime.
    ///
    /// The status is `Connecting` by the time this returns.
    pub(crate) fn spawn(
        endpoint: Endpoint,
        config: StreamConfig,
        registry: Arc<SubscriptionRegistry>,
        shared: Arc<ConnectionShared>,
    ) -> StreamResult<ConnectionHandle> {
        let runtime = Handle::try_current().map_err(|_| StreamError::NoRuntime)?;
        let epoch = shared.begin()?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let connection = Self {
            endpoint,
            config,
            dispatcher: EventDispatcher::new(registry),
            shared,
            epoch,
            outbound: outbound_rx,
            cancel: cancel.clone(),
        };

        let task = runtime.spawn(connection.run());
        Ok(ConnectionHandle {
            task,
            outbound: outbound_tx,
            cancel: cancel.drop_guard(),
        })
    }

    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let mut retry = RetryState::default();

        loop {
            self.shared.transition(self.epoch, ConnectionState::Connecting);

            let opened = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                opened = TransportSocket::open(&self.endpoint, self.config.connect_timeout()) => opened,
            };

            let close = match opened {
                Ok(socket) => self.pump(socket, &mut retry).await,
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "failed to open socket");
                    CloseEvent::abnormal(e.to_string())
                }
            };
            self.discard_outbound();

            if cancel.is_cancelled() {
                break;
            }

            self.shared.transition(self.epoch, ConnectionState::Disconnected);
            self.shared.emit(
                self.epoch,
                ConnectionEvent::Disconnected {
                    code: close.code,
                    reason: close.reason.clone(),
                },
            );

            if close.is_clean() {
                break;
            }

            if !self.config.reconnect.should_retry(retry.attempt(), &close) {
                warn!(
                    endpoint = %self.endpoint,
                    attempts = retry.attempt(),
                    reason = %close.reason,
                    "giving up on connection"
                );
                self.shared.fail(self.epoch, retry.attempt(), close.reason);
                return;
            }

            let delay = self.config.reconnect.jittered_delay(retry.attempt());
            retry.increment();
            info!(
                endpoint = %self.endpoint,
                attempt = retry.attempt(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                code = close.code,
                "scheduling reconnect"
            );
            self.shared.emit(
                self.epoch,
                ConnectionEvent::Reconnecting {
                    attempt: retry.attempt(),
                    delay,
                },
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = sleep(delay) => {}
            }
        }

        debug!(endpoint = %self.endpoint, "connection task stopped");
    }

    /// Drive one open socket until it closes.
    async fn pump(&mut self, mut socket: TransportSocket, retry: &mut RetryState) -> CloseEvent {
        let cancel = self.cancel.clone();
        let mut keepalive = Keepalive::new(self.config.keepalive);
        let mut ticker = keepalive.ticker();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return socket.close(CLOSE_NORMAL, CLIENT_DISCONNECT).await;
                }
                Some(text) = self.outbound.recv() => {
                    if let Err(e) = socket.send(text).await {
                        warn!(error = %e, "failed to send message");
                    }
                }
                () = next_tick(&mut ticker) => match keepalive.tick() {
                    KeepaliveAction::Ping => {
                        if let Err(e) = socket.ping().await {
                            debug!(error = %e, "keepalive ping failed");
                        }
                    }
                    KeepaliveAction::Expired => {
                        warn!(
                            endpoint = %self.endpoint,
                            missed = keepalive.missed(),
                            "no traffic from server, dropping socket"
                        );
                        return CloseEvent::abnormal("keepalive timeout");
                    }
                },
                event = socket.next_event() => match event {
                    LifecycleEvent::Opened => {
                        retry.reset();
                        self.shared.transition(self.epoch, ConnectionState::Connected);
                        self.shared.emit(self.epoch, ConnectionEvent::Connected);
                        info!(endpoint = %self.endpoint, "connected");
                    }
                    LifecycleEvent::MessageReceived(frame) => {
                        keepalive.activity();
                        self.dispatcher.on_frame(&frame);
                    }
                    LifecycleEvent::Heartbeat => keepalive.activity(),
                    LifecycleEvent::Errored(e) => {
                        warn!(endpoint = %self.endpoint, error = %e, "socket error");
                    }
                    LifecycleEvent::Closed(close) => {
                        debug!(code = close.code, reason = %close.reason, "socket closed");
                        return close;
                    }
                },
            }
        }
    }

    /// Queued frames never carry over to a later socket.
    fn discard_outbound(&mut self) {
        let mut dropped = 0usize;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "discarded queued messages after close");
        }
    }
}
