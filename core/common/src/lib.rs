//! Common utilities and types shared across listshare crates.
//!
//! This module provides the error taxonomy and the identifier types used by
//! the remote provider, the sync engine and the CLI.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    normalize_url, original_url_for, AnnotationId, LocalListId, RemoteId, UserId,
};
