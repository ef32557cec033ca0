//! Remote sharing store abstraction for listshare.
//!
//! This module provides a trait-based interface to the remote store that
//! shared lists, list entries and annotations are pushed to, plus an
//! in-memory implementation used by tests, the CLI demo and development.
//!
//! # Design Principles
//! - Opaque references: callers only ever persist link ids
//! - Idempotent writes: replaying a call never duplicates remote records
//! - Async operations: all calls are async and may suspend on I/O

pub mod memory;
pub mod provider;

pub use memory::{
    MemoryProvider, RemoteSnapshot, SharedAnnotationListEntryRecord, SharedAnnotationRecord,
    SharedListEntryRecord, SharedListRecord,
};
pub use provider::{
    AnnotationsByPage, RemoteOperation, SharedAnnotationData, SharedAnnotationEntry,
    SharedAnnotationReference, SharedListData, SharedListEntryData, SharedListReference,
    SharingProvider, UserReference,
};
