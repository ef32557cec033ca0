//! Sharing provider trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use listshare_common::{AnnotationId, LocalListId, RemoteId, Result, UserId};

/// Opaque reference to a list in the remote sharing store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SharedListReference(RemoteId);

impl SharedListReference {
    /// Wrap a provider-issued id.
    pub fn new(id: RemoteId) -> Self {
        Self(id)
    }

    /// The provider-issued id behind this reference.
    pub fn id(&self) -> &RemoteId {
        &self.0
    }
}

/// Opaque reference to an annotation in the remote sharing store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SharedAnnotationReference(RemoteId);

impl SharedAnnotationReference {
    /// Wrap a provider-issued id.
    pub fn new(id: RemoteId) -> Self {
        Self(id)
    }

    /// The provider-issued id behind this reference.
    pub fn id(&self) -> &RemoteId {
        &self.0
    }
}

/// The user on whose behalf remote records are created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserReference {
    pub id: UserId,
}

impl UserReference {
    pub fn new(id: UserId) -> Self {
        Self { id }
    }
}

/// Data for a newly shared list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedListData {
    pub title: String,
    pub description: Option<String>,
}

/// One page entry to add to a shared list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedListEntryData {
    /// When the page was added locally; `None` means "now" on the remote side.
    pub created_when: Option<DateTime<Utc>>,
    pub entry_title: Option<String>,
    pub normalized_url: String,
    pub original_url: String,
}

/// One local annotation to create remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedAnnotationData {
    pub local_id: AnnotationId,
    pub created_when: Option<DateTime<Utc>>,
    pub body: Option<String>,
    pub comment: Option<String>,
    /// JSON-encoded highlight selector.
    pub selector: Option<String>,
}

/// An already shared annotation to attach to lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedAnnotationEntry {
    pub created_when: DateTime<Utc>,
    pub normalized_page_url: String,
    pub reference: SharedAnnotationReference,
}

/// Annotations grouped by the normalized URL of the page they belong to.
pub type AnnotationsByPage = BTreeMap<String, Vec<SharedAnnotationData>>;

/// The remote operations a provider exposes, used for call logs and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteOperation {
    CreateSharedList,
    CreateListEntries,
    RemoveListEntries,
    UpdateListTitle,
    CreateAnnotations,
    AddAnnotationsToLists,
    UpdateAnnotationComment,
    RemoveAnnotations,
    RemoveAnnotationsFromLists,
}

/// Remote sharing store client.
///
/// Every mutating operation must be safe to repeat: creates are keyed on the
/// natural identity of what they create (list + normalized URL, creator +
/// local annotation id, annotation + list) and removals of missing records
/// succeed. The sync executor relies on this to replay actions after a crash.
#[async_trait]
pub trait SharingProvider: Send + Sync {
    /// Get the provider name (e.g., "memory").
    fn name(&self) -> &str;

    /// Create a new shared list.
    ///
    /// Not idempotent: every call creates a fresh list. Callers store the
    /// returned reference before doing anything else with the list.
    async fn create_shared_list(
        &self,
        list: SharedListData,
        creator: &UserReference,
        local_list_id: LocalListId,
    ) -> Result<SharedListReference>;

    /// Add page entries to a shared list, updating entries that already exist.
    async fn create_list_entries(
        &self,
        list: &SharedListReference,
        entries: &[SharedListEntryData],
        creator: &UserReference,
    ) -> Result<()>;

    /// Remove the entry for a page from a shared list.
    async fn remove_list_entries(
        &self,
        list: &SharedListReference,
        normalized_url: &str,
    ) -> Result<()>;

    /// Change the title of a shared list.
    ///
    /// # Errors
    /// - The list does not exist remotely
    async fn update_list_title(&self, list: &SharedListReference, title: &str) -> Result<()>;

    /// Create annotations and attach them to the given lists.
    ///
    /// # Returns
    /// The reference of every annotation passed in, keyed by its local id.
    async fn create_annotations(
        &self,
        creator: &UserReference,
        lists: &[SharedListReference],
        annotations_by_page: &AnnotationsByPage,
    ) -> Result<HashMap<AnnotationId, SharedAnnotationReference>>;

    /// Attach already shared annotations to lists.
    async fn add_annotations_to_lists(
        &self,
        creator: &UserReference,
        lists: &[SharedListReference],
        annotations: &[SharedAnnotationEntry],
    ) -> Result<()>;

    /// Replace the comment of a shared annotation.
    async fn update_annotation_comment(
        &self,
        annotation: &SharedAnnotationReference,
        comment: &str,
    ) -> Result<()>;

    /// Delete annotations together with all their list associations.
    async fn remove_annotations(&self, annotations: &[SharedAnnotationReference]) -> Result<()>;

    /// Detach annotations from lists without deleting the annotations.
    async fn remove_annotations_from_lists(
        &self,
        lists: &[SharedListReference],
        annotations: &[SharedAnnotationReference],
    ) -> Result<()>;

    /// Turn a list reference into the plain id stored locally.
    fn shared_list_link_id(&self, list: &SharedListReference) -> RemoteId {
        list.id().clone()
    }

    /// Turn a stored list id back into a reference.
    fn shared_list_reference_from_link_id(&self, id: &RemoteId) -> Result<SharedListReference> {
        Ok(SharedListReference::new(id.clone()))
    }

    /// Turn an annotation reference into the plain id stored locally.
    fn shared_annotation_link_id(&self, annotation: &SharedAnnotationReference) -> RemoteId {
        annotation.id().clone()
    }

    /// Turn a stored annotation id back into a reference.
    fn shared_annotation_reference_from_link_id(
        &self,
        id: &RemoteId,
    ) -> Result<SharedAnnotationReference> {
        Ok(SharedAnnotationReference::new(id.clone()))
    }
}
