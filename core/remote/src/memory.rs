//! In-memory sharing provider for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use listshare_common::{AnnotationId, Error, LocalListId, RemoteId, Result, UserId};

use crate::provider::{
    AnnotationsByPage, RemoteOperation, SharedAnnotationEntry, SharedAnnotationReference,
    SharedListData, SharedListEntryData, SharedListReference, SharingProvider, UserReference,
};

/// A row of the remote `sharedList` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedListRecord {
    pub id: u64,
    pub creator: UserId,
    pub created_when: DateTime<Utc>,
    pub updated_when: DateTime<Utc>,
    pub title: String,
    pub description: Option<String>,
}

/// A row of the remote `sharedListEntry` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedListEntryRecord {
    pub id: u64,
    pub creator: UserId,
    pub shared_list: u64,
    pub created_when: DateTime<Utc>,
    pub updated_when: DateTime<Utc>,
    pub original_url: String,
    pub normalized_url: String,
    pub entry_title: Option<String>,
}

/// A row of the remote `sharedAnnotation` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedAnnotationRecord {
    pub id: u64,
    pub creator: UserId,
    pub local_id: AnnotationId,
    pub normalized_page_url: String,
    pub created_when: DateTime<Utc>,
    pub updated_when: DateTime<Utc>,
    pub body: Option<String>,
    pub comment: Option<String>,
    pub selector: Option<String>,
}

/// A row of the remote `sharedAnnotationListEntry` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedAnnotationListEntryRecord {
    pub id: u64,
    pub creator: UserId,
    pub shared_list: u64,
    pub shared_annotation: u64,
    pub normalized_page_url: String,
    pub created_when: DateTime<Utc>,
    pub updated_when: DateTime<Utc>,
}

/// Snapshot of every remote table, ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSnapshot {
    pub shared_lists: Vec<SharedListRecord>,
    pub shared_list_entries: Vec<SharedListEntryRecord>,
    pub shared_annotations: Vec<SharedAnnotationRecord>,
    pub shared_annotation_list_entries: Vec<SharedAnnotationListEntryRecord>,
}

#[derive(Debug, Default)]
struct Tables {
    next_id: u64,
    lists: Vec<SharedListRecord>,
    list_entries: Vec<SharedListEntryRecord>,
    annotations: Vec<SharedAnnotationRecord>,
    annotation_list_entries: Vec<SharedAnnotationListEntryRecord>,
    calls: Vec<RemoteOperation>,
    failures: HashMap<RemoteOperation, (u32, String)>,
}

impl Tables {
    fn mint_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Record a call, failing it if a failure was planned for this operation.
    fn begin(&mut self, operation: RemoteOperation) -> Result<()> {
        let planned = self.failures.get_mut(&operation).map(|(remaining, message)| {
            *remaining = remaining.saturating_sub(1);
            (*remaining, message.clone())
        });
        if let Some((remaining, message)) = planned {
            if remaining == 0 {
                self.failures.remove(&operation);
            }
            debug!("Injected failure for {:?}: {}", operation, message);
            return Err(Error::RemoteOperationFailed(message));
        }
        self.calls.push(operation);
        Ok(())
    }

    fn require_list(&self, id: u64) -> Result<()> {
        if self.lists.iter().any(|l| l.id == id) {
            Ok(())
        } else {
            Err(Error::RemoteOperationFailed(format!(
                "Shared list not found: {}",
                id
            )))
        }
    }

    fn link_annotation(
        &mut self,
        creator: &UserId,
        list: u64,
        annotation: u64,
        normalized_page_url: &str,
        created_when: DateTime<Utc>,
    ) {
        let exists = self
            .annotation_list_entries
            .iter()
            .any(|e| e.shared_list == list && e.shared_annotation == annotation);
        if exists {
            return;
        }

        let id = self.mint_id();
        self.annotation_list_entries
            .push(SharedAnnotationListEntryRecord {
                id,
                creator: creator.clone(),
                shared_list: list,
                shared_annotation: annotation,
                normalized_page_url: normalized_page_url.to_string(),
                created_when,
                updated_when: Utc::now(),
            });
    }
}

/// In-memory sharing provider.
///
/// Useful for testing and development. All data is stored in memory and
/// lost on drop. Ids are numeric and travel as decimal link ids.
#[derive(Clone)]
pub struct MemoryProvider {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryProvider {
    /// Create a new empty memory provider.
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| Error::RemoteOperationFailed("Memory provider lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| Error::RemoteOperationFailed("Memory provider lock poisoned".to_string()))
    }

    fn numeric_id(id: &RemoteId) -> Result<u64> {
        id.as_str()
            .parse()
            .map_err(|_| Error::InvalidInput(format!("Not a memory provider id: {}", id)))
    }

    fn remote_id(id: u64) -> Result<RemoteId> {
        RemoteId::new(id.to_string())
    }

    /// Make the next `times` calls of `operation` fail with `message`.
    pub fn fail_next(&self, operation: RemoteOperation, times: u32, message: impl Into<String>) {
        if times == 0 {
            return;
        }
        if let Ok(mut tables) = self.write() {
            tables.failures.insert(operation, (times, message.into()));
        }
    }

    /// Operations that were applied, in order. Failed calls are not recorded.
    pub fn calls(&self) -> Vec<RemoteOperation> {
        self.read().map(|t| t.calls.clone()).unwrap_or_default()
    }

    /// Copy of every remote table.
    pub fn snapshot(&self) -> RemoteSnapshot {
        self.read()
            .map(|t| RemoteSnapshot {
                shared_lists: t.lists.clone(),
                shared_list_entries: t.list_entries.clone(),
                shared_annotations: t.annotations.clone(),
                shared_annotation_list_entries: t.annotation_list_entries.clone(),
            })
            .unwrap_or_default()
    }

    pub fn shared_lists(&self) -> Vec<SharedListRecord> {
        self.snapshot().shared_lists
    }

    pub fn shared_list_entries(&self) -> Vec<SharedListEntryRecord> {
        self.snapshot().shared_list_entries
    }

    pub fn shared_annotations(&self) -> Vec<SharedAnnotationRecord> {
        self.snapshot().shared_annotations
    }

    pub fn shared_annotation_list_entries(&self) -> Vec<SharedAnnotationListEntryRecord> {
        self.snapshot().shared_annotation_list_entries
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharingProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_shared_list(
        &self,
        list: SharedListData,
        creator: &UserReference,
        local_list_id: LocalListId,
    ) -> Result<SharedListReference> {
        let mut tables = self.write()?;
        tables.begin(RemoteOperation::CreateSharedList)?;

        let id = tables.mint_id();
        let now = Utc::now();
        tables.lists.push(SharedListRecord {
            id,
            creator: creator.id.clone(),
            created_when: now,
            updated_when: now,
            title: list.title,
            description: list.description,
        });
        debug!("Created shared list {} for local list {}", id, local_list_id);

        Ok(SharedListReference::new(Self::remote_id(id)?))
    }

    async fn create_list_entries(
        &self,
        list: &SharedListReference,
        entries: &[SharedListEntryData],
        creator: &UserReference,
    ) -> Result<()> {
        let list_id = Self::numeric_id(list.id())?;
        let mut tables = self.write()?;
        tables.begin(RemoteOperation::CreateListEntries)?;
        tables.require_list(list_id)?;

        let now = Utc::now();
        for entry in entries {
            let existing = tables
                .list_entries
                .iter_mut()
                .find(|e| e.shared_list == list_id && e.normalized_url == entry.normalized_url);
            if let Some(existing) = existing {
                existing.entry_title = entry.entry_title.clone();
                existing.original_url = entry.original_url.clone();
                existing.updated_when = now;
                continue;
            }

            let id = tables.mint_id();
            tables.list_entries.push(SharedListEntryRecord {
                id,
                creator: creator.id.clone(),
                shared_list: list_id,
                created_when: entry.created_when.unwrap_or(now),
                updated_when: now,
                original_url: entry.original_url.clone(),
                normalized_url: entry.normalized_url.clone(),
                entry_title: entry.entry_title.clone(),
            });
        }

        Ok(())
    }

    async fn remove_list_entries(
        &self,
        list: &SharedListReference,
        normalized_url: &str,
    ) -> Result<()> {
        let list_id = Self::numeric_id(list.id())?;
        let mut tables = self.write()?;
        tables.begin(RemoteOperation::RemoveListEntries)?;

        tables
            .list_entries
            .retain(|e| !(e.shared_list == list_id && e.normalized_url == normalized_url));
        Ok(())
    }

    async fn update_list_title(&self, list: &SharedListReference, title: &str) -> Result<()> {
        let list_id = Self::numeric_id(list.id())?;
        let mut tables = self.write()?;
        tables.begin(RemoteOperation::UpdateListTitle)?;

        let record = tables
            .lists
            .iter_mut()
            .find(|l| l.id == list_id)
            .ok_or_else(|| {
                Error::RemoteOperationFailed(format!("Shared list not found: {}", list_id))
            })?;
        record.title = title.to_string();
        record.updated_when = Utc::now();
        Ok(())
    }

    async fn create_annotations(
        &self,
        creator: &UserReference,
        lists: &[SharedListReference],
        annotations_by_page: &AnnotationsByPage,
    ) -> Result<HashMap<AnnotationId, SharedAnnotationReference>> {
        let list_ids = lists
            .iter()
            .map(|l| Self::numeric_id(l.id()))
            .collect::<Result<Vec<_>>>()?;
        let mut tables = self.write()?;
        tables.begin(RemoteOperation::CreateAnnotations)?;
        for list_id in &list_ids {
            tables.require_list(*list_id)?;
        }

        let now = Utc::now();
        let mut references = HashMap::new();
        for (page_url, annotations) in annotations_by_page {
            for data in annotations {
                let existing = tables
                    .annotations
                    .iter()
                    .find(|a| a.creator == creator.id && a.local_id == data.local_id)
                    .map(|a| a.id);
                let annotation_id = match existing {
                    Some(id) => id,
                    None => {
                        let id = tables.mint_id();
                        tables.annotations.push(SharedAnnotationRecord {
                            id,
                            creator: creator.id.clone(),
                            local_id: data.local_id.clone(),
                            normalized_page_url: page_url.clone(),
                            created_when: data.created_when.unwrap_or(now),
                            updated_when: now,
                            body: data.body.clone(),
                            comment: data.comment.clone(),
                            selector: data.selector.clone(),
                        });
                        id
                    }
                };

                for list_id in &list_ids {
                    tables.link_annotation(
                        &creator.id,
                        *list_id,
                        annotation_id,
                        page_url,
                        data.created_when.unwrap_or(now),
                    );
                }

                references.insert(
                    data.local_id.clone(),
                    SharedAnnotationReference::new(Self::remote_id(annotation_id)?),
                );
            }
        }

        Ok(references)
    }

    async fn add_annotations_to_lists(
        &self,
        creator: &UserReference,
        lists: &[SharedListReference],
        annotations: &[SharedAnnotationEntry],
    ) -> Result<()> {
        let list_ids = lists
            .iter()
            .map(|l| Self::numeric_id(l.id()))
            .collect::<Result<Vec<_>>>()?;
        let annotation_ids = annotations
            .iter()
            .map(|a| Self::numeric_id(a.reference.id()))
            .collect::<Result<Vec<_>>>()?;
        let mut tables = self.write()?;
        tables.begin(RemoteOperation::AddAnnotationsToLists)?;
        for list_id in &list_ids {
            tables.require_list(*list_id)?;
        }

        for (entry, annotation_id) in annotations.iter().zip(annotation_ids) {
            // Annotations removed in the meantime are not resurrected as dangling links
            if !tables.annotations.iter().any(|a| a.id == annotation_id) {
                debug!("Skipping link of missing annotation {}", annotation_id);
                continue;
            }
            for list_id in &list_ids {
                tables.link_annotation(
                    &creator.id,
                    *list_id,
                    annotation_id,
                    &entry.normalized_page_url,
                    entry.created_when,
                );
            }
        }

        Ok(())
    }

    async fn update_annotation_comment(
        &self,
        annotation: &SharedAnnotationReference,
        comment: &str,
    ) -> Result<()> {
        let annotation_id = Self::numeric_id(annotation.id())?;
        let mut tables = self.write()?;
        tables.begin(RemoteOperation::UpdateAnnotationComment)?;

        let record = tables
            .annotations
            .iter_mut()
            .find(|a| a.id == annotation_id)
            .ok_or_else(|| {
                Error::RemoteOperationFailed(format!(
                    "Shared annotation not found: {}",
                    annotation_id
                ))
            })?;
        record.comment = Some(comment.to_string());
        record.updated_when = Utc::now();
        Ok(())
    }

    async fn remove_annotations(&self, annotations: &[SharedAnnotationReference]) -> Result<()> {
        let annotation_ids = annotations
            .iter()
            .map(|a| Self::numeric_id(a.id()))
            .collect::<Result<Vec<_>>>()?;
        let mut tables = self.write()?;
        tables.begin(RemoteOperation::RemoveAnnotations)?;

        tables
            .annotation_list_entries
            .retain(|e| !annotation_ids.contains(&e.shared_annotation));
        tables.annotations.retain(|a| !annotation_ids.contains(&a.id));
        Ok(())
    }

    async fn remove_annotations_from_lists(
        &self,
        lists: &[SharedListReference],
        annotations: &[SharedAnnotationReference],
    ) -> Result<()> {
        let list_ids = lists
            .iter()
            .map(|l| Self::numeric_id(l.id()))
            .collect::<Result<Vec<_>>>()?;
        let annotation_ids = annotations
            .iter()
            .map(|a| Self::numeric_id(a.id()))
            .collect::<Result<Vec<_>>>()?;
        let mut tables = self.write()?;
        tables.begin(RemoteOperation::RemoveAnnotationsFromLists)?;

        tables.annotation_list_entries.retain(|e| {
            !(list_ids.contains(&e.shared_list) && annotation_ids.contains(&e.shared_annotation))
        });
        Ok(())
    }

    fn shared_list_reference_from_link_id(&self, id: &RemoteId) -> Result<SharedListReference> {
        Self::numeric_id(id)?;
        Ok(SharedListReference::new(id.clone()))
    }

    fn shared_annotation_reference_from_link_id(
        &self,
        id: &RemoteId,
    ) -> Result<SharedAnnotationReference> {
        Self::numeric_id(id)?;
        Ok(SharedAnnotationReference::new(id.clone()))
    }
}
