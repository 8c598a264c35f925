//! Downstream notification of committed records.
//!
//! A [`Notifier`] is handed to each ingestion worker at construction and
//! follows an `init → notify → close` lifecycle scoped to that worker.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{MetadbError, Result};
use crate::types::{PackageId, PackageVersionId};

/// Sent once per committed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredNotification {
    pub product: String,
    pub forge: String,
    pub version: String,
    pub generator: String,
    pub package_id: PackageId,
    pub package_version_id: PackageVersionId,
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn notify(&self, notification: &StoredNotification) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Drops every notification.
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait::async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _notification: &StoredNotification) -> Result<()> {
        Ok(())
    }
}

/// Forwards notifications into a bounded tokio channel.
#[derive(Debug)]
pub struct ChannelNotifier {
    sender: Mutex<Option<mpsc::Sender<StoredNotification>>>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StoredNotification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::from_sender(tx), rx)
    }

    /// Share one receiver between several workers by cloning the sender.
    pub fn from_sender(sender: mpsc::Sender<StoredNotification>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notification: &StoredNotification) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .expect("notifier mutex poisoned")
            .clone()
            .ok_or_else(|| MetadbError::Notify("notifier is closed".into()))?;
        sender
            .send(notification.clone())
            .await
            .map_err(|_| MetadbError::Notify("receiver dropped".into()))
    }

    async fn close(&self) -> Result<()> {
        self.sender.lock().expect("notifier mutex poisoned").take();
        Ok(())
    }
}
