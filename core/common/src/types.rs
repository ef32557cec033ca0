//! Common types used throughout listshare.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Identifier of a local custom list, assigned by the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalListId(pub i64);

impl LocalListId {
    /// Get the raw numeric id.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LocalListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for LocalListId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Identifier of a local annotation (its annotation URL).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotationId(String);

impl AnnotationId {
    /// Create an annotation id from its URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnnotationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AnnotationId {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

/// Opaque identifier assigned by the remote sharing store.
///
/// Remote ids travel as plain strings ("link ids"); the provider that minted
/// them is the only party that knows how to turn them back into references.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    /// Create a new RemoteId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "RemoteId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the signed-in user, as supplied by the auth subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a new UserId.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "UserId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalize a page URL into the form used as page identity.
///
/// Drops the scheme, a leading `www.`, the fragment, tracking (`utm_*`)
/// query parameters and a trailing slash, so `https://www.eggs.com/foo/`
/// becomes `eggs.com/foo`. Input without a scheme is accepted.
///
/// # Errors
/// - Returns error if the input cannot be parsed as a URL with a host
pub fn normalize_url(raw: &str) -> crate::Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(crate::Error::InvalidInput("URL cannot be empty".to_string()));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };

    let url = Url::parse(&with_scheme)
        .map_err(|e| crate::Error::InvalidInput(format!("Invalid URL {}: {}", raw, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| crate::Error::InvalidInput(format!("URL has no host: {}", raw)))?;
    let host = host.strip_prefix("www.").unwrap_or(host);

    let mut normalized = host.to_string();
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{}", port));
    }
    normalized.push_str(url.path().trim_end_matches('/'));

    if let Some(query) = url.query() {
        let kept: Vec<&str> = query
            .split('&')
            .filter(|pair| !pair.is_empty() && !pair.starts_with("utm_"))
            .collect();
        if !kept.is_empty() {
            normalized.push('?');
            normalized.push_str(&kept.join("&"));
        }
    }

    Ok(normalized)
}

/// Rebuild a full URL for a normalized page URL.
pub fn original_url_for(normalized_url: &str) -> String {
    format!("https://{}", normalized_url)
}
