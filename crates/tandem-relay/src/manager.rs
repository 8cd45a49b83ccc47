//! Session registry: admission, dispatch, liveness, and expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tandem_common::new_id;
use tandem_protocol::{Transport, TransportEvent, TransportSender};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::RelayError;
use crate::session::{
    Connection, CreateSessionOptions, Session, SessionInfo, MAX_SESSION_TTL,
};

type SessionHandle = Arc<Mutex<Session>>;

/// Owns every session on this relay. Cheap to clone.
///
/// The map lock is only held to look sessions up, insert or remove them;
/// frame handling locks just the one session it touches.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ManagerConfig,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    /// Admission counter; orders connections for first-come-first-served.
    next_seq: AtomicU64,
}

impl SessionManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: RwLock::new(HashMap::new()),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    async fn session(&self, session_id: &str) -> Option<SessionHandle> {
        self.inner.sessions.read().await.get(session_id).cloned()
    }

    // -----------------------------------------------------------------------
    // Administrative operations
    // -----------------------------------------------------------------------

    pub async fn create_session(
        &self,
        options: CreateSessionOptions,
    ) -> Result<SessionInfo, RelayError> {
        let config = &self.inner.config;
        let session_id = options.session_id.unwrap_or_else(new_id);

        let mut map = self.inner.sessions.write().await;
        if map.contains_key(&session_id) {
            return Err(RelayError::SessionExists(session_id));
        }

        let ttl = options.expires_in.unwrap_or(config.default_ttl);
        if ttl > MAX_SESSION_TTL {
            warn!(session = %session_id, requested = ?ttl, "Clamping session lifetime");
        }
        let session = Session::new(
            session_id.clone(),
            ttl,
            options.conflict_policy.unwrap_or(config.default_policy),
            options.metadata.unwrap_or(serde_json::Value::Null),
            config.role_management,
            config.protocol_version,
        );
        let info = session.info();
        map.insert(session_id.clone(), Arc::new(Mutex::new(session)));

        info!(session = %session_id, policy = %info.conflict_policy, "Session created");
        Ok(info)
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        let session = self.session(session_id).await?;
        let guard = session.lock().await;
        Some(guard.info())
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let handles: Vec<SessionHandle> =
            self.inner.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            infos.push(handle.lock().await.info());
        }
        infos.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        infos
    }

    /// Remove a session and close its connections.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), RelayError> {
        let session = self
            .inner
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or(RelayError::SessionNotFound)?;
        session.lock().await.close_all("session deleted");
        info!(session = %session_id, "Session deleted");
        Ok(())
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Admit an inbound transport into `session_id`.
    ///
    /// A rejected transport is closed with the error text as its reason.
    /// On success the connection is announced and a task is spawned to pump
    /// its frames; the returned id names the new connection.
    pub async fn admit(&self, session_id: &str, transport: Transport) -> Result<String, RelayError> {
        let (sender, events) = transport.into_parts();

        let Some(session) = self.session(session_id).await else {
            return Err(reject(&sender, session_id, RelayError::SessionNotFound));
        };

        let connection_id = {
            let mut guard = session.lock().await;
            if guard.closed {
                return Err(reject(&sender, session_id, RelayError::SessionClosed));
            }
            if guard.is_full() {
                return Err(reject(&sender, session_id, RelayError::SessionFull));
            }
            let connection_id = new_id();
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            guard.add_connection(Connection::new(connection_id.clone(), sender.clone(), seq));
            connection_id
        };

        tokio::spawn(drive_connection(
            self.clone(),
            session_id.to_string(),
            connection_id.clone(),
            sender,
            events,
        ));
        Ok(connection_id)
    }

    /// Apply one inbound frame, then act on what it asked for.
    pub async fn handle_message(&self, session_id: &str, connection_id: &str, text: &str) {
        let Some(session) = self.session(session_id).await else {
            return;
        };

        let transfer_started = {
            let mut guard = session.lock().await;
            let dispatch = guard.handle_frame(connection_id, text);
            if let Some((id, reason)) = &dispatch.close {
                guard.remove_connection(id, Some(reason));
            }
            dispatch.transfer_started
        };

        if let (Some(transfer_id), Some(timeout)) =
            (transfer_started, self.inner.config.transfer_decision_timeout)
        {
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                session.lock().await.expire_transfer(transfer_id);
            });
        }
    }

    /// Drop a connection. Returns false if it was already gone.
    pub async fn disconnect(
        &self,
        session_id: &str,
        connection_id: &str,
        reason: Option<&str>,
    ) -> bool {
        let Some(session) = self.session(session_id).await else {
            return false;
        };
        let mut guard = session.lock().await;
        guard.remove_connection(connection_id, reason).is_some()
    }

    async fn record_heartbeat(&self, session_id: &str, connection_id: &str) {
        if let Some(session) = self.session(session_id).await {
            session.lock().await.record_heartbeat(connection_id);
        }
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    /// Ping every connection and evict those whose transport is gone.
    /// Returns the number evicted.
    pub async fn heartbeat(&self) -> usize {
        let handles: Vec<SessionHandle> =
            self.inner.sessions.read().await.values().cloned().collect();
        let mut evicted = 0;
        for handle in handles {
            let mut session = handle.lock().await;
            for connection_id in session.heartbeat() {
                if session
                    .remove_connection(&connection_id, Some("connection lost"))
                    .is_some()
                {
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            info!(evicted, "Heartbeat evicted dead connections");
        }
        evicted
    }

    /// Remove expired sessions and empty ones past the grace period.
    /// Returns the number removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let grace = self.inner.config.empty_session_grace;

        let mut map = self.inner.sessions.write().await;
        let mut doomed = Vec::new();
        for (id, handle) in map.iter() {
            let session = handle.lock().await;
            if session.is_expired(now) || session.is_abandoned(now, grace) {
                doomed.push(id.clone());
            }
        }

        for id in &doomed {
            if let Some(handle) = map.remove(id) {
                handle.lock().await.close_all("session expired");
                info!(session = %id, "Session swept");
            }
        }
        debug!(removed = doomed.len(), remaining = map.len(), "Sweep tick");
        doomed.len()
    }

    /// Start the heartbeat and sweep loops.
    pub fn spawn_maintenance(&self) -> Maintenance {
        let heartbeat = {
            let manager = self.clone();
            let every = self.inner.config.heartbeat_interval;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(every).await;
                    manager.heartbeat().await;
                }
            })
        };
        let sweep = {
            let manager = self.clone();
            let every = self.inner.config.cleanup_interval;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(every).await;
                    manager.sweep().await;
                }
            })
        };
        Maintenance { heartbeat, sweep }
    }
}

/// Handles for the background liveness loops.
pub struct Maintenance {
    heartbeat: JoinHandle<()>,
    sweep: JoinHandle<()>,
}

impl Maintenance {
    pub fn shutdown(self) {
        self.heartbeat.abort();
        self.sweep.abort();
    }
}

fn reject(sender: &TransportSender, session_id: &str, error: RelayError) -> RelayError {
    warn!(session = %session_id, error = %error, "Rejecting connection");
    sender.close(Some(&error.to_string()));
    error
}

/// Pump one connection's inbound events into the manager until it closes.
async fn drive_connection(
    manager: SessionManager,
    session_id: String,
    connection_id: String,
    sender: TransportSender,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    let reason = loop {
        let event = tokio::select! {
            event = events.recv() => event,
            // Closed by the relay (session deleted, expired, evicted).
            reason = sender.closed() => break reason,
        };
        match event {
            Some(TransportEvent::Message(text)) => {
                manager.handle_message(&session_id, &connection_id, &text).await;
            }
            Some(TransportEvent::Ping) => {
                let _ = sender.pong();
                manager.record_heartbeat(&session_id, &connection_id).await;
            }
            Some(TransportEvent::Pong) => {
                manager.record_heartbeat(&session_id, &connection_id).await;
            }
            Some(TransportEvent::Closed(reason)) => break reason,
            Some(TransportEvent::Error(e)) => {
                warn!(session = %session_id, connection = %connection_id, error = %e, "Transport error");
                break Some(e);
            }
            None => break None,
        }
    };

    manager
        .disconnect(&session_id, &connection_id, reason.as_deref())
        .await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tandem_protocol::transport::memory_pair;
    use tandem_protocol::ConflictPolicy;

    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(ManagerConfig {
            transfer_decision_timeout: None,
            ..ManagerConfig::default()
        })
    }

    #[tokio::test]
    async fn create_session_uses_defaults() {
        let manager = manager();
        let info = manager
            .create_session(CreateSessionOptions::default())
            .await
            .unwrap();
        assert_eq!(info.client_count, 0);
        assert_eq!(info.conflict_policy, ConflictPolicy::FirstComeFirstServed);
        assert_eq!(info.expires_at - info.created_at, 30 * 60 * 1000);
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn huge_lifetime_is_clamped() {
        let manager = manager();
        let info = manager
            .create_session(CreateSessionOptions {
                expires_in: Some(Duration::from_secs(u64::MAX)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            info.expires_at - info.created_at,
            MAX_SESSION_TTL.as_millis() as u64
        );
        assert_eq!(manager.sweep().await, 0);
        assert!(manager.get_session(&info.session_id).await.is_some());
    }

    #[tokio::test]
    async fn duplicate_session_id_is_refused() {
        let manager = manager();
        let options = CreateSessionOptions {
            session_id: Some("abc".into()),
            ..Default::default()
        };
        manager.create_session(options.clone()).await.unwrap();
        assert_eq!(
            manager.create_session(options).await,
            Err(RelayError::SessionExists("abc".into()))
        );
    }

    #[tokio::test]
    async fn admit_unknown_session_closes_transport() {
        let manager = manager();
        let (relay_side, client_side) = memory_pair();
        let err = manager.admit("missing", relay_side).await.unwrap_err();
        assert_eq!(err, RelayError::SessionNotFound);

        let (_tx, mut rx) = client_side.into_parts();
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Closed(Some("session not found".into())))
        );
    }

    #[tokio::test]
    async fn delete_session_closes_connections() {
        let manager = manager();
        let info = manager
            .create_session(CreateSessionOptions::default())
            .await
            .unwrap();
        let (relay_side, client_side) = memory_pair();
        manager.admit(&info.session_id, relay_side).await.unwrap();

        manager.delete_session(&info.session_id).await.unwrap();
        assert!(manager.get_session(&info.session_id).await.is_none());
        assert_eq!(
            manager.delete_session(&info.session_id).await,
            Err(RelayError::SessionNotFound)
        );

        let (_tx, mut rx) = client_side.into_parts();
        let mut closed = None;
        while let Some(event) = rx.recv().await {
            if let TransportEvent::Closed(reason) = event {
                closed = reason;
                break;
            }
        }
        assert_eq!(closed.as_deref(), Some("session deleted"));
    }

    #[tokio::test]
    async fn sweep_keeps_fresh_empty_sessions() {
        let manager = SessionManager::new(ManagerConfig {
            empty_session_grace: Duration::from_millis(50),
            ..ManagerConfig::default()
        });
        let info = manager
            .create_session(CreateSessionOptions::default())
            .await
            .unwrap();

        assert_eq!(manager.sweep().await, 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(manager.sweep().await, 1);
        assert!(manager.get_session(&info.session_id).await.is_none());
    }

    #[tokio::test]
    async fn pong_refreshes_last_heartbeat() {
        let manager = manager();
        let info = manager
            .create_session(CreateSessionOptions::default())
            .await
            .unwrap();
        let (relay_side, client_side) = memory_pair();
        let connection_id = manager.admit(&info.session_id, relay_side).await.unwrap();
        let connected = manager.get_session(&info.session_id).await.unwrap();
        let before = connected.connection(&connection_id).unwrap().clone();
        assert_eq!(before.last_heartbeat, before.connected_at);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let (client_tx, _client_rx) = client_side.into_parts();
        client_tx.pong().unwrap();

        let mut seen = before.last_heartbeat;
        for _ in 0..50 {
            let info = manager.get_session(&info.session_id).await.unwrap();
            seen = info.connection(&connection_id).unwrap().last_heartbeat;
            if seen > before.last_heartbeat {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen >= before.connected_at + 20);
    }

    #[tokio::test]
    async fn heartbeat_evicts_dead_transports() {
        let manager = manager();
        let info = manager
            .create_session(CreateSessionOptions::default())
            .await
            .unwrap();
        let (relay_side, client_side) = memory_pair();
        manager.admit(&info.session_id, relay_side).await.unwrap();
        assert_eq!(manager.heartbeat().await, 0);

        // Dropping the client end tears down the pump carrying relay frames.
        drop(client_side);
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.heartbeat().await;
        let info = manager.get_session(&info.session_id).await.unwrap();
        assert_eq!(info.client_count, 0);
    }
}
