//! Bidirectional, message-oriented channel between a peer and the relay.
//!
//! A [`Transport`] is a pair of tokio channels: a cloneable
//! [`TransportSender`] for outbound frames and a receiver of
//! [`TransportEvent`]s. The concrete socket lives in a background pump task
//! ([`websocket`]) or is another in-process transport ([`memory_pair`]).
//! Both ends of the core (client and relay) only ever see this shape.

mod memory;
mod websocket;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

pub use memory::memory_pair;
pub use websocket::websocket;

/// Per-direction channel capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// Frames written towards the remote end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Pong,
    Close(Option<String>),
}

/// Events observed from the remote end. A receiver that yields `None`
/// means the channel is gone, same as `Closed(None)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Ping,
    Pong,
    Closed(Option<String>),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport send buffer full")]
    Full,
}

/// `None` while open; `Some(reason)` once a close was asked for.
type CloseState = Option<Option<String>>;

/// Non-blocking write half. Cheap to clone; all clones feed the same socket.
///
/// Closing does not go through the frame queue: a peer that stopped reading
/// fills the queue, and its socket must still be shut.
#[derive(Debug, Clone)]
pub struct TransportSender {
    tx: mpsc::Sender<Outbound>,
    close: Arc<watch::Sender<CloseState>>,
}

impl TransportSender {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        let (close, _) = watch::channel(None);
        Self {
            tx,
            close: Arc::new(close),
        }
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(Outbound::Text(text.into()))
    }

    pub fn ping(&self) -> Result<(), TransportError> {
        self.send(Outbound::Ping)
    }

    pub fn pong(&self) -> Result<(), TransportError> {
        self.send(Outbound::Pong)
    }

    /// Ask the pump to close the underlying socket. Only the first reason
    /// counts; later calls are no-ops.
    pub fn close(&self, reason: Option<&str>) {
        let reason = reason.map(str::to_string);
        let first = self.close.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason.clone());
            true
        });
        if first {
            // Lets a pump that is idle on the queue see the close in order.
            let _ = self.send(Outbound::Close(reason));
        }
    }

    /// False once closed, or once the pump (and with it the socket) has
    /// gone away.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed() && self.close.borrow().is_none()
    }

    /// Resolves with the reason once any clone calls [`close`](Self::close).
    pub async fn closed(&self) -> Option<String> {
        self.close_signal().requested().await
    }

    pub(crate) fn close_signal(&self) -> CloseSignal {
        CloseSignal {
            rx: self.close.subscribe(),
        }
    }

    fn send(&self, frame: Outbound) -> Result<(), TransportError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

/// Pump-side view of [`TransportSender::close`].
pub(crate) struct CloseSignal {
    rx: watch::Receiver<CloseState>,
}

impl CloseSignal {
    pub(crate) async fn requested(&mut self) -> Option<String> {
        let state = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map(|state| state.clone().flatten());
        match state {
            Ok(reason) => reason,
            // Every sender is gone; the frame queue reports that instead.
            Err(_) => std::future::pending().await,
        }
    }
}

/// Both halves of one connection.
#[derive(Debug)]
pub struct Transport {
    pub sender: TransportSender,
    pub events: mpsc::Receiver<TransportEvent>,
}

impl Transport {
    pub fn new(sender: TransportSender, events: mpsc::Receiver<TransportEvent>) -> Self {
        Self { sender, events }
    }

    pub fn into_parts(self) -> (TransportSender, mpsc::Receiver<TransportEvent>) {
        (self.sender, self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_reports_full_and_closed() {
        let (tx, rx) = mpsc::channel(1);
        let sender = TransportSender::new(tx);
        assert!(sender.send_text("a").is_ok());
        assert_eq!(sender.send_text("b"), Err(TransportError::Full));

        drop(rx);
        assert!(!sender.is_open());
        assert_eq!(sender.ping(), Err(TransportError::Closed));
    }

    #[test]
    fn close_without_queue_room_still_closes() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = TransportSender::new(tx);
        sender.send_text("fills the queue").unwrap();

        sender.close(Some("session deleted"));
        sender.close(Some("ignored"));
        assert!(!sender.is_open());
    }

    #[tokio::test]
    async fn closed_resolves_with_first_reason() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = TransportSender::new(tx);
        let watcher = sender.clone();
        let waiting = tokio::spawn(async move { watcher.closed().await });

        sender.close(Some("session expired"));
        sender.close(None);
        assert_eq!(waiting.await.unwrap(), Some("session expired".into()));
    }

    #[test]
    fn close_enqueues_reason() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = TransportSender::new(tx);
        sender.close(Some("session full"));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close(Some("session full".into()))
        );
    }
}
