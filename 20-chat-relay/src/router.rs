use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::{
    envelope::Envelope,
    error::DeliveryError,
    registry::{ConnectionHandle, ConnectionRegistry},
};

/// Moves chat messages between registered connections.
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<ConnectionRegistry>,
}

/// Who a broadcast reached, and who it did not.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failed: Vec<DeliveryError>,
}

impl Router {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Sends `message` to `destination` only. No acknowledgement, no retry.
    pub async fn direct(
        &self,
        source: &str,
        destination: &str,
        message: &str,
    ) -> Result<(), DeliveryError> {
        let frame: Arc<str> = Envelope::private(source, destination, message)
            .encode()
            .into();
        let handle = self
            .registry
            .get(destination)
            .await
            .ok_or_else(|| DeliveryError::NotFound(destination.to_string()))?;

        deliver(destination, &handle, frame)?;
        debug!(source, destination, "private message delivered");
        Ok(())
    }

    /// Sends `message` to everyone registered except `source`.
    ///
    /// Recipients are taken from a registry snapshot, so logins and logouts
    /// racing with the broadcast neither disturb the iteration nor cause
    /// duplicate deliveries. One recipient failing does not stop the rest.
    pub async fn broadcast(&self, source: &str, message: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let frame: Arc<str> = Envelope::public(source, message).encode().into();

        for (identity, handle) in self.registry.snapshot().await {
            if identity == source {
                continue;
            }
            match deliver(&identity, &handle, Arc::clone(&frame)) {
                Ok(()) => report.delivered.push(identity),
                Err(err) => {
                    warn!(source, error = %err, "broadcast delivery dropped");
                    report.failed.push(err);
                }
            }
        }

        debug!(
            source,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "public message broadcast"
        );
        report
    }
}

fn deliver(
    identity: &str,
    handle: &ConnectionHandle,
    frame: Arc<str>,
) -> Result<(), DeliveryError> {
    handle.deliver(frame).map_err(|err| match err {
        TrySendError::Full(_) => DeliveryError::QueueFull(identity.to_string()),
        TrySendError::Closed(_) => DeliveryError::Disconnected(identity.to_string()),
    })
}
