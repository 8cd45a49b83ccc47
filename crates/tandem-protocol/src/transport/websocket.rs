//! WebSocket form of [`Transport`], for both client and server sockets.

use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use super::{
    CloseSignal, Outbound, Transport, TransportEvent, TransportSender, DEFAULT_CAPACITY,
};

/// How long a requested close may spend flushing before the socket is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Wrap an established WebSocket (from `connect_async` or
/// `accept_hdr_async`) and spawn the pump that owns it.
pub fn websocket<S>(ws: WebSocketStream<S>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel(DEFAULT_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(DEFAULT_CAPACITY);
    let sender = TransportSender::new(out_tx);
    tokio::spawn(pump(ws, out_rx, in_tx, sender.close_signal()));
    Transport::new(sender, in_rx)
}

enum Next {
    Send(Message),
    Receive(TransportEvent, bool),
    Skip,
    Close(Option<String>),
    Hangup,
}

enum Flow {
    Continue,
    Close(Option<String>),
    Hangup,
    Stop,
}

async fn pump<S>(
    ws: WebSocketStream<S>,
    mut outbound: mpsc::Receiver<Outbound>,
    inbound: mpsc::Sender<TransportEvent>,
    mut closing: CloseSignal,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();

    loop {
        let next = tokio::select! {
            biased;
            reason = closing.requested() => Next::Close(reason),
            frame = outbound.recv() => match frame {
                Some(Outbound::Close(reason)) => Next::Close(reason),
                Some(frame) => Next::Send(message(frame)),
                None => Next::Hangup,
            },
            frame = stream.next() => match received(frame) {
                Some((event, last)) => Next::Receive(event, last),
                None => Next::Skip,
            },
        };

        // Writes towards a stalled peer or reader must not hold up a close.
        let flow = match next {
            Next::Send(message) => tokio::select! {
                biased;
                reason = closing.requested() => Flow::Close(reason),
                sent = sink.send(message) => match sent {
                    Ok(()) => Flow::Continue,
                    Err(e) => {
                        tracing::debug!(error = %e, "WS send failed");
                        let _ = inbound.try_send(TransportEvent::Error(e.to_string()));
                        Flow::Stop
                    }
                },
            },
            Next::Receive(event, last) => tokio::select! {
                biased;
                reason = closing.requested() => Flow::Close(reason),
                sent = inbound.send(event) => match sent {
                    Ok(()) if last => Flow::Stop,
                    Ok(()) => Flow::Continue,
                    // Nobody is listening any more.
                    Err(_) => Flow::Hangup,
                },
            },
            Next::Skip => Flow::Continue,
            Next::Close(reason) => Flow::Close(reason),
            Next::Hangup => Flow::Hangup,
        };

        match flow {
            Flow::Continue => continue,
            Flow::Close(reason) => {
                if tokio::time::timeout(CLOSE_GRACE, shutdown(&mut sink, &mut outbound, reason))
                    .await
                    .is_err()
                {
                    tracing::debug!("WS close handshake timed out, dropping socket");
                }
            }
            Flow::Hangup => {
                let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
            }
            Flow::Stop => {}
        }
        break;
    }
}

/// Flush frames queued ahead of the close, then send the close frame.
async fn shutdown<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    outbound: &mut mpsc::Receiver<Outbound>,
    reason: Option<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Ok(frame) = outbound.try_recv() {
        if matches!(frame, Outbound::Close(_)) {
            break;
        }
        if sink.feed(message(frame)).await.is_err() {
            return;
        }
    }
    let _ = sink.send(close_message(reason)).await;
}

fn message(frame: Outbound) -> Message {
    match frame {
        Outbound::Text(text) => Message::Text(text.into()),
        Outbound::Ping => Message::Ping(Default::default()),
        Outbound::Pong => Message::Pong(Default::default()),
        Outbound::Close(reason) => close_message(reason),
    }
}

fn close_message(reason: Option<String>) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: reason.unwrap_or_default().into(),
    }))
}

/// Map a socket frame to an event; `None` for frames the pump swallows.
/// The flag marks the last event the socket will produce.
fn received(frame: Option<Result<Message, WsError>>) -> Option<(TransportEvent, bool)> {
    match frame {
        Some(Ok(Message::Text(text))) => Some((TransportEvent::Message(text.to_string()), false)),
        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some((TransportEvent::Message(text), false)),
            Err(_) => {
                tracing::debug!("Dropping non-UTF-8 binary frame");
                None
            }
        },
        // tungstenite answers pings on its own.
        Some(Ok(Message::Ping(_))) => None,
        Some(Ok(Message::Pong(_))) => Some((TransportEvent::Pong, false)),
        Some(Ok(Message::Close(frame))) => {
            let reason = frame
                .map(|f| f.reason.to_string())
                .filter(|r| !r.is_empty());
            Some((TransportEvent::Closed(reason), true))
        }
        Some(Ok(_)) => None,
        Some(Err(e)) => Some((TransportEvent::Error(e.to_string()), true)),
        None => Some((TransportEvent::Closed(None), true)),
    }
}
