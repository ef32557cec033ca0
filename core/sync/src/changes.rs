//! Local storage mutation events and the channel that carries them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use listshare_common::{AnnotationId, Error, LocalListId, Result};

/// Local collections whose mutations matter for sharing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    CustomLists,
    PageListEntries,
    Annotations,
    /// Any other collection; ignored by the detector.
    Other(String),
}

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Modify,
    Delete,
}

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    /// The user changed something on this device.
    #[default]
    Local,
    /// Cloud sync applied a change made elsewhere.
    Sync,
}

/// Primary key of a mutated object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrimaryKey {
    List(LocalListId),
    /// Compound key of a page list entry; `page_url` is normalized.
    #[serde(rename_all = "camelCase")]
    ListEntry {
        list_id: LocalListId,
        page_url: String,
    },
    Annotation(AnnotationId),
}

/// One committed mutation of the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageChange {
    pub collection: Collection,
    pub change_type: ChangeType,
    pub primary_keys: Vec<PrimaryKey>,
    /// Values of a created object, or the fields a modification touched.
    #[serde(default)]
    pub changed_fields: Map<String, Value>,
    #[serde(default)]
    pub source: ChangeSource,
}

impl StorageChange {
    /// A local change without field values.
    pub fn new(collection: Collection, change_type: ChangeType, primary_keys: Vec<PrimaryKey>) -> Self {
        Self {
            collection,
            change_type,
            primary_keys,
            changed_fields: Map::new(),
            source: ChangeSource::Local,
        }
    }

    /// Attach one changed field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.changed_fields.insert(name.into(), value.into());
        self
    }

    /// Set the origin of the change.
    pub fn with_source(mut self, source: ChangeSource) -> Self {
        self.source = source;
        self
    }

    /// A string field value, if the field is present and a string.
    pub fn string_field(&self, name: &str) -> Option<&str> {
        self.changed_fields.get(name).and_then(Value::as_str)
    }

    /// Whether the change touched `name` at all.
    pub fn touches(&self, name: &str) -> bool {
        self.changed_fields.contains_key(name)
    }
}

/// Messages consumed by the detector task.
#[derive(Debug)]
pub enum DetectorMessage {
    Change(StorageChange),
    /// Answered once every earlier message has been handled.
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Sending side of the mutation event stream.
///
/// Notifying never waits for the detector, so the store that emits events is
/// never slowed down by sharing work.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: mpsc::UnboundedSender<DetectorMessage>,
}

/// Receiving side of a [`ChangeFeed`].
pub type ChangeFeedReceiver = mpsc::UnboundedReceiver<DetectorMessage>;

impl ChangeFeed {
    /// Create a connected feed and receiver.
    pub fn channel() -> (Self, ChangeFeedReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publish a committed mutation.
    pub fn notify(&self, change: StorageChange) -> Result<()> {
        debug!(
            "Storage change: {:?} {:?} ({} keys)",
            change.change_type,
            change.collection,
            change.primary_keys.len()
        );
        self.tx
            .send(DetectorMessage::Change(change))
            .map_err(|_| Error::Channel("Change detector not running".to_string()))
    }

    /// Wait until every change notified so far has been handled.
    pub async fn flush(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DetectorMessage::Flush(reply_tx))
            .map_err(|_| Error::Channel("Change detector not running".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Channel("Change detector stopped before flushing".to_string()))
    }

    /// Ask the detector task to stop after the changes already queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(DetectorMessage::Shutdown);
    }

    /// Whether the detector task has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
