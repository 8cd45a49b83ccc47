//! Shared harness: real relay manager, real clients, in-memory transports.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tandem_client::{ClientConfig, Connector, RelayClient};
use tandem_common::SyncError;
use tandem_protocol::transport::memory_pair;
use tandem_protocol::{ConflictPolicy, Transport};
use tandem_relay::{CreateSessionOptions, ManagerConfig, SessionManager};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;

pub const RELAY_URL: &str = "memory://relay";
pub const WAIT: Duration = Duration::from_secs(3);

/// Admits every connection straight into the manager.
pub struct MemoryConnector {
    manager: SessionManager,
}

impl MemoryConnector {
    pub fn new(manager: SessionManager) -> Arc<Self> {
        Arc::new(Self { manager })
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _relay_url: &str, session_id: &str) -> Result<Transport, SyncError> {
        let (relay_side, client_side) = memory_pair();
        // A refused admission closes `relay_side`; the client sees it while
        // waiting for the handshake ACK.
        let _ = self.manager.admit(session_id, relay_side).await;
        Ok(client_side)
    }
}

/// Hands out transports whose far end never answers.
#[derive(Default)]
pub struct SilentConnector {
    held: Mutex<Vec<Transport>>,
}

impl SilentConnector {
    /// Far end of the most recent connection.
    pub async fn far_side(&self) -> Option<Transport> {
        self.held.lock().await.pop()
    }
}

#[async_trait]
impl Connector for SilentConnector {
    async fn connect(&self, _relay_url: &str, _session_id: &str) -> Result<Transport, SyncError> {
        let (far_side, client_side) = memory_pair();
        self.held.lock().await.push(far_side);
        Ok(client_side)
    }
}

pub fn manager(policy: ConflictPolicy) -> SessionManager {
    SessionManager::new(ManagerConfig {
        default_policy: policy,
        ..ManagerConfig::default()
    })
}

pub async fn session(manager: &SessionManager) -> String {
    manager
        .create_session(CreateSessionOptions::default())
        .await
        .unwrap()
        .session_id
}

pub fn config(name: &str) -> ClientConfig {
    ClientConfig {
        client_id: name.to_string(),
        max_reconnect_attempts: 3,
        reconnect_delay: Duration::from_millis(20),
        connection_timeout: Duration::from_secs(1),
        role_transfer_timeout: Duration::from_secs(1),
        ..ClientConfig::default()
    }
}

pub fn client(manager: &SessionManager, config: ClientConfig) -> RelayClient {
    RelayClient::with_connector(config, MemoryConnector::new(manager.clone()))
}

pub async fn connected(manager: &SessionManager, session_id: &str, name: &str) -> RelayClient {
    let client = client(manager, config(name));
    client.connect(RELAY_URL, session_id).await.unwrap();
    client
}

/// Next event matching `pred`, skipping others.
pub async fn wait_for<T: Clone>(
    rx: &mut broadcast::Receiver<T>,
    mut pred: impl FnMut(&T) -> bool,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("event not observed in time")
}

/// True if no event arrives within a short window.
pub async fn quiet<T: Clone>(rx: &mut broadcast::Receiver<T>) -> bool {
    tokio::time::timeout(Duration::from_millis(150), rx.recv())
        .await
        .is_err()
}

/// Poll `check` until it holds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
