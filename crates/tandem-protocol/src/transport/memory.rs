//! In-process duplex transport.
//!
//! Used by embedders that host the relay and a client in one process, and
//! by the integration tests. Each direction is a forwarding task that turns
//! the writer's [`Outbound`] frames into the reader's [`TransportEvent`]s.

use tokio::sync::mpsc;

use super::{
    CloseSignal, Outbound, Transport, TransportEvent, TransportSender, DEFAULT_CAPACITY,
};

/// Create two connected transports. Must be called inside a tokio runtime.
pub fn memory_pair() -> (Transport, Transport) {
    let (a_out_tx, a_out_rx) = mpsc::channel(DEFAULT_CAPACITY);
    let (b_out_tx, b_out_rx) = mpsc::channel(DEFAULT_CAPACITY);
    let (a_in_tx, a_in_rx) = mpsc::channel(DEFAULT_CAPACITY);
    let (b_in_tx, b_in_rx) = mpsc::channel(DEFAULT_CAPACITY);

    let a_tx = TransportSender::new(a_out_tx);
    let b_tx = TransportSender::new(b_out_tx);

    tokio::spawn(forward(
        a_out_rx,
        b_in_tx,
        a_tx.close_signal(),
        b_tx.close_signal(),
    ));
    tokio::spawn(forward(
        b_out_rx,
        a_in_tx,
        b_tx.close_signal(),
        a_tx.close_signal(),
    ));

    (
        Transport::new(a_tx, a_in_rx),
        Transport::new(b_tx, b_in_rx),
    )
}

enum Step {
    Deliver(TransportEvent, bool),
    Close(Option<String>),
    Stop,
}

/// One direction: `writer` closes it with a reason, `reader` closing its
/// own side shuts it silently.
async fn forward(
    mut rx: mpsc::Receiver<Outbound>,
    tx: mpsc::Sender<TransportEvent>,
    mut writer: CloseSignal,
    mut reader: CloseSignal,
) {
    loop {
        let step = tokio::select! {
            biased;
            reason = writer.requested() => Step::Close(reason),
            _ = reader.requested() => Step::Stop,
            _ = tx.closed() => Step::Stop,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    let (event, last) = to_event(frame);
                    Step::Deliver(event, last)
                }
                None => Step::Stop,
            },
        };

        let step = match step {
            Step::Deliver(event, last) => tokio::select! {
                biased;
                reason = writer.requested() => Step::Close(reason),
                _ = reader.requested() => Step::Stop,
                sent = tx.send(event) => match sent {
                    Ok(()) if !last => continue,
                    _ => Step::Stop,
                },
            },
            step => step,
        };

        if let Step::Close(reason) = step {
            // Whatever still fits goes out ahead of the close.
            while let Ok(frame) = rx.try_recv() {
                let (event, last) = to_event(frame);
                if last || tx.try_send(event).is_err() {
                    break;
                }
            }
            tokio::select! {
                _ = tx.send(TransportEvent::Closed(reason)) => {}
                _ = reader.requested() => {}
            }
        }
        return;
    }
}

fn to_event(frame: Outbound) -> (TransportEvent, bool) {
    match frame {
        Outbound::Text(text) => (TransportEvent::Message(text), false),
        Outbound::Ping => (TransportEvent::Ping, false),
        Outbound::Pong => (TransportEvent::Pong, false),
        Outbound::Close(reason) => (TransportEvent::Closed(reason), true),
    }
}
