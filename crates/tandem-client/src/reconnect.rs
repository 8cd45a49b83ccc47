//! Reader task, connection loss, and the fixed-delay reconnect policy.
//!
//! The reader spawns the reconnect loop and the reconnect loop spawns a new
//! reader, so both return boxed futures.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tandem_common::SyncError;
use tandem_protocol::{TransportEvent, TransportSender};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::RelayClient;
use crate::types::ConnectionStatus;

impl RelayClient {
    /// Feed inbound frames to the handler until the transport goes away.
    pub(crate) fn read_loop(
        &self,
        sender: TransportSender,
        mut events: mpsc::Receiver<TransportEvent>,
        generation: u64,
    ) -> BoxFuture<'static, ()> {
        let client = self.clone();
        async move {
            let reason = loop {
                match events.recv().await {
                    Some(TransportEvent::Message(text)) => client.handle_frame(&text).await,
                    Some(TransportEvent::Ping) => {
                        let _ = sender.pong();
                    }
                    Some(TransportEvent::Pong) => {}
                    Some(TransportEvent::Closed(reason)) => break reason,
                    Some(TransportEvent::Error(e)) => {
                        warn!(error = %e, "Transport error");
                        break Some(e);
                    }
                    None => break None,
                }
            };
            client.connection_lost(generation, reason).await;
        }
        .boxed()
    }

    /// The transport of `generation` closed without `disconnect` being called.
    async fn connection_lost(&self, generation: u64, reason: Option<String>) {
        let mut st = self.shared.state.lock().await;
        if st.generation != generation || st.status != ConnectionStatus::Connected {
            return;
        }
        warn!(
            client = %self.client_id(),
            reason = reason.as_deref().unwrap_or("closed"),
            "Lost connection to relay"
        );

        st.outbound = None;
        st.connection_id = None;
        st.reader = None;
        self.reset_session_state(&mut st);

        if st.auto_reconnect && st.target.is_some() {
            self.set_status(&mut st, ConnectionStatus::Reconnecting { attempt: 1 });
            st.reconnect = Some(tokio::spawn(self.reconnect_loop()));
        } else {
            self.set_status(&mut st, ConnectionStatus::Disconnected);
        }
    }

    /// Retry after a fixed delay until connected or out of attempts.
    fn reconnect_loop(&self) -> BoxFuture<'static, ()> {
        let client = self.clone();
        async move {
            let config = &client.shared.config;
            loop {
                let attempt = {
                    let mut st = client.shared.state.lock().await;
                    if !st.auto_reconnect {
                        return;
                    }
                    if st.reconnect_attempts >= config.max_reconnect_attempts {
                        st.reconnect = None;
                        client.set_status(&mut st, ConnectionStatus::Disconnected);
                        drop(st);
                        warn!(
                            client = %client.client_id(),
                            attempts = config.max_reconnect_attempts,
                            "Giving up on relay"
                        );
                        client.emit_error(SyncError::MaxReconnectAttemptsExceeded(
                            config.max_reconnect_attempts,
                        ));
                        return;
                    }
                    st.reconnect_attempts += 1;
                    let attempt = st.reconnect_attempts;
                    client.set_status(&mut st, ConnectionStatus::Reconnecting { attempt });
                    attempt
                };

                tokio::time::sleep(config.reconnect_delay).await;
                debug!(client = %client.client_id(), attempt, "Reconnecting");

                match client.establish().await {
                    Ok(()) => {
                        client.shared.state.lock().await.reconnect = None;
                        info!(client = %client.client_id(), attempt, "Reconnected");
                        return;
                    }
                    Err(e) => {
                        warn!(client = %client.client_id(), attempt, error = %e, "Reconnect attempt failed");
                        client.emit_error(e);
                    }
                }
            }
        }
        .boxed()
    }
}
