//! Control-message protocol between clients and the worker.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use offgrid_common::{Error, Result};

use crate::worker::OfflineWorker;

/// A request sent to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Append to the background record log.
    StoreBackgroundData { payload: Value },
    /// Queue an alert and request a sync.
    QueueEmergencyAlert { payload: Value },
    /// Read the background record log.
    GetBackgroundData,
    /// Empty the background record log.
    ClearBackgroundData,
    /// Request an on-demand sync.
    TriggerBackgroundSync,
}

/// The single reply to a [`ControlMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::ok()
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

type Envelope = (ControlMessage, oneshot::Sender<ControlReply>);

/// Create a paired request/reply channel.
pub fn control_channel(capacity: usize) -> (ControlClient, ControlServer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ControlClient { tx }, ControlServer { rx })
}

/// Sending side; cloneable, one per connected client.
#[derive(Clone)]
pub struct ControlClient {
    tx: mpsc::Sender<Envelope>,
}

impl ControlClient {
    /// Send a message and wait for its reply.
    ///
    /// # Errors
    /// - The server is gone or dropped the reply channel
    pub async fn request(&self, message: ControlMessage) -> Result<ControlReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((message, reply_tx))
            .await
            .map_err(|_| Error::Closed("Control server not running".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Closed("Control server dropped the reply".to_string()))
    }
}

/// Receiving side, driven by [`ControlServer::serve`].
pub struct ControlServer {
    rx: mpsc::Receiver<Envelope>,
}

impl ControlServer {
    /// Answer messages until every client is dropped.
    pub async fn serve(mut self, worker: Arc<OfflineWorker>) {
        info!("Control channel open");
        while let Some((message, reply)) = self.rx.recv().await {
            debug!("Control message: {:?}", message);
            let answer = worker.handle_message(message).await;
            if reply.send(answer).is_err() {
                debug!("Control client went away before the reply");
            }
        }
        info!("Control channel closed");
    }
}
