//! Listshare sync engine
//!
//! Shares local lists, their pages and annotations with a remote store:
//! - Durable FIFO queue of sharing actions in SQLite
//! - Single-flight executor with timed retry after failures
//! - Local-to-remote id mappings
//! - Change detector turning storage changes into sharing actions
//! - Event hub with a short replay window for late subscribers

pub mod action;
pub mod auth;
pub mod changes;
pub mod config;
pub mod db;
pub mod detector;
pub mod engine;
pub mod events;
pub mod executor;
pub mod local;
pub mod queue;
pub mod remote_ids;
pub mod retry;
pub mod state;

// Re-export main types
pub use action::{QueuedAction, RemoteAnnotationEntry, SharingAction};
pub use auth::{AuthProvider, StaticAuth};
pub use changes::{
    ChangeFeed, ChangeSource, ChangeType, Collection, DetectorMessage, PrimaryKey, StorageChange,
};
pub use config::SharingConfig;
pub use db::SharingDatabase;
pub use detector::ChangeDetector;
pub use engine::{ContentSharing, SessionHandle};
pub use events::{EventHub, EventSubscription, SharingEvent};
pub use executor::SyncExecutor;
pub use local::{
    AnnotationContent, LocalAnnotation, LocalCollections, LocalList, MemoryCollections,
    PageListEntry,
};
pub use queue::ActionQueue;
pub use remote_ids::{EntityKind, RemoteIdMapping, RemoteIdStore};
pub use retry::RetryPolicy;
pub use state::{SharingPhase, SharingStatus};
