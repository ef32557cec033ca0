//! Queued sharing actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use listshare_common::{AnnotationId, Error, LocalListId, RemoteId, Result};
use listshare_remote::{AnnotationsByPage, SharedListEntryData};

use crate::local::LocalAnnotation;

/// A shared annotation to attach to lists, as stored in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAnnotationEntry {
    pub normalized_page_url: String,
    pub remote_id: RemoteId,
    pub created_when: DateTime<Utc>,
}

/// One unit of deferred remote work.
///
/// Every variant carries everything needed to run it later, and running it
/// twice leaves the remote store in the same state as running it once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SharingAction {
    AddSharedListEntries {
        local_list_id: LocalListId,
        remote_list_id: RemoteId,
        data: Vec<SharedListEntryData>,
    },
    RemoveSharedListEntry {
        local_list_id: LocalListId,
        remote_list_id: RemoteId,
        normalized_url: String,
    },
    ChangeSharedListTitle {
        local_list_id: LocalListId,
        remote_list_id: RemoteId,
        new_title: String,
    },
    /// `local_list_ids` are the shared lists holding the pages when queued.
    /// Execution links every shared list holding the pages at that time.
    ShareAnnotations {
        local_list_ids: Vec<LocalListId>,
        data: AnnotationsByPage,
    },
    AddAnnotationEntries {
        remote_list_ids: Vec<RemoteId>,
        remote_annotations: Vec<RemoteAnnotationEntry>,
    },
    UpdateAnnotationComment {
        local_annotation_id: AnnotationId,
        remote_annotation_id: RemoteId,
        updated_comment: String,
    },
    UnshareAnnotations {
        remote_annotation_ids: Vec<RemoteId>,
    },
    RemoveSharedAnnotationListEntries {
        remote_list_id: RemoteId,
        remote_annotation_ids: Vec<RemoteId>,
    },
}

impl SharingAction {
    /// The serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            SharingAction::AddSharedListEntries { .. } => "add-shared-list-entries",
            SharingAction::RemoveSharedListEntry { .. } => "remove-shared-list-entry",
            SharingAction::ChangeSharedListTitle { .. } => "change-shared-list-title",
            SharingAction::ShareAnnotations { .. } => "share-annotations",
            SharingAction::AddAnnotationEntries { .. } => "add-annotation-entries",
            SharingAction::UpdateAnnotationComment { .. } => "update-annotation-comment",
            SharingAction::UnshareAnnotations { .. } => "unshare-annotations",
            SharingAction::RemoveSharedAnnotationListEntries { .. } => {
                "remove-shared-annotation-list-entries"
            }
        }
    }

    /// Encode for storage.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Serialization(format!("Failed to encode {}: {}", self.kind(), e)))
    }

    /// Decode from storage.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Serialization(format!("Failed to decode sharing action: {}", e)))
    }
}

/// An action as stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
    /// Queue position; strictly increasing in enqueue order.
    pub id: i64,
    pub queued_at: DateTime<Utc>,
    pub action: SharingAction,
}

/// Split list entries into `add-shared-list-entries` actions of at most `chunk_size` entries.
pub fn list_entry_batches(
    local_list_id: LocalListId,
    remote_list_id: &RemoteId,
    entries: Vec<SharedListEntryData>,
    chunk_size: usize,
) -> Vec<SharingAction> {
    entries
        .chunks(chunk_size.max(1))
        .map(|chunk| SharingAction::AddSharedListEntries {
            local_list_id,
            remote_list_id: remote_list_id.clone(),
            data: chunk.to_vec(),
        })
        .collect()
}

/// Build the action that attaches already shared annotations to lists.
///
/// Annotations without a remote mapping are left out. Returns `None` when
/// nothing is left to attach.
pub fn annotation_entries(
    annotations: &[LocalAnnotation],
    remote_annotation_ids: &BTreeMap<AnnotationId, RemoteId>,
    remote_list_ids: Vec<RemoteId>,
) -> Option<SharingAction> {
    if remote_list_ids.is_empty() {
        return None;
    }

    let remote_annotations: Vec<RemoteAnnotationEntry> = annotations
        .iter()
        .filter_map(|annotation| {
            remote_annotation_ids
                .get(&annotation.url)
                .map(|remote_id| RemoteAnnotationEntry {
                    normalized_page_url: annotation.page_url.clone(),
                    remote_id: remote_id.clone(),
                    created_when: annotation.created_when.unwrap_or_else(Utc::now),
                })
        })
        .collect();

    if remote_annotations.is_empty() {
        return None;
    }

    Some(SharingAction::AddAnnotationEntries {
        remote_list_ids,
        remote_annotations,
    })
}
