//! Turns local storage mutations into queued sharing actions.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use listshare_common::{normalize_url, original_url_for, AnnotationId, LocalListId, RemoteId, Result};
use listshare_remote::{SharedListEntryData, SharingProvider};

use crate::action::{annotation_entries, list_entry_batches, SharingAction};
use crate::changes::{
    ChangeFeedReceiver, ChangeSource, ChangeType, Collection, DetectorMessage, PrimaryKey,
    StorageChange,
};
use crate::events::{EventHub, SharingEvent};
use crate::executor::SyncExecutor;
use crate::local::{LocalAnnotation, LocalCollections};
use crate::remote_ids::RemoteIdStore;

/// Watches local mutations and queues the matching remote work.
pub struct ChangeDetector<P: SharingProvider + ?Sized> {
    executor: SyncExecutor<P>,
    remote_ids: RemoteIdStore,
    collections: Arc<dyn LocalCollections>,
    events: EventHub,
    chunk_size: usize,
    process_sync_changes: Arc<AtomicBool>,
}

impl<P: SharingProvider + ?Sized> Clone for ChangeDetector<P> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            remote_ids: self.remote_ids.clone(),
            collections: self.collections.clone(),
            events: self.events.clone(),
            chunk_size: self.chunk_size,
            process_sync_changes: self.process_sync_changes.clone(),
        }
    }
}

impl<P: SharingProvider + ?Sized + 'static> ChangeDetector<P> {
    /// Create a detector.
    pub fn new(
        executor: SyncExecutor<P>,
        remote_ids: RemoteIdStore,
        collections: Arc<dyn LocalCollections>,
        events: EventHub,
        chunk_size: usize,
        process_sync_changes: Arc<AtomicBool>,
    ) -> Self {
        Self {
            executor,
            remote_ids,
            collections,
            events,
            chunk_size,
            process_sync_changes,
        }
    }

    /// Consume the feed until it is shut down or every sender is gone.
    ///
    /// A failing change is logged and skipped; it never stops the loop.
    pub async fn run(self, mut rx: ChangeFeedReceiver) {
        info!("Change detector started");

        while let Some(message) = rx.recv().await {
            match message {
                DetectorMessage::Change(change) => {
                    if let Err(e) = self.handle_change(&change).await {
                        warn!(
                            "Failed to share {:?} {:?}: {}",
                            change.change_type, change.collection, e
                        );
                    }
                }
                DetectorMessage::Flush(reply) => {
                    let _ = reply.send(());
                }
                DetectorMessage::Shutdown => {
                    info!("Received shutdown request");
                    break;
                }
            }
        }

        info!("Change detector stopped");
    }

    /// Queue the actions for one mutation, then drain.
    ///
    /// All actions derived from the change are queued before draining, so a
    /// remote failure cannot lose any of them.
    pub async fn handle_change(&self, change: &StorageChange) -> Result<()> {
        if change.source == ChangeSource::Sync && !self.process_sync_changes.load(Ordering::SeqCst) {
            debug!("Ignoring sync change on {:?}", change.collection);
            return Ok(());
        }

        let queued = match (&change.collection, change.change_type) {
            (Collection::PageListEntries, ChangeType::Create) => self.entries_added(change).await?,
            (Collection::PageListEntries, ChangeType::Delete) => self.entries_removed(change).await?,
            (Collection::CustomLists, ChangeType::Modify) => self.list_renamed(change)?,
            (Collection::Annotations, ChangeType::Modify) => self.annotation_edited(change)?,
            (Collection::Annotations, ChangeType::Delete) => self.annotations_deleted(change)?,
            _ => 0,
        };

        if queued > 0 {
            debug!("Queued {} sharing actions", queued);
            self.executor.kick().await?;
        }
        Ok(())
    }

    async fn entries_added(&self, change: &StorageChange) -> Result<usize> {
        let full_url = change.string_field("fullUrl");
        let mut queued = 0;

        for (list_id, page_urls) in entries_by_list(&change.primary_keys) {
            let Some(remote_list_id) = self.remote_ids.get_remote_list_id(list_id)? else {
                continue;
            };

            let titles = self.collections.page_titles(&page_urls).await?;
            let now = Utc::now();
            let entries = page_urls
                .iter()
                .map(|page_url| SharedListEntryData {
                    created_when: Some(now),
                    entry_title: titles.get(page_url).cloned(),
                    normalized_url: page_url.clone(),
                    original_url: original_url(page_url, full_url),
                })
                .collect();
            for action in list_entry_batches(list_id, &remote_list_id, entries, self.chunk_size) {
                self.executor.enqueue(&action)?;
                queued += 1;
            }

            let annotations = self.collections.annotations_for_pages(&page_urls).await?;
            queued += self.enqueue_annotation_entries(&annotations, vec![remote_list_id])?;

            for page_url in page_urls {
                self.events
                    .publish(SharingEvent::PageAddedToSharedList { page_url });
            }
        }

        Ok(queued)
    }

    async fn entries_removed(&self, change: &StorageChange) -> Result<usize> {
        let mut queued = 0;

        for (list_id, page_urls) in entries_by_list(&change.primary_keys) {
            let Some(remote_list_id) = self.remote_ids.get_remote_list_id(list_id)? else {
                continue;
            };

            for page_url in page_urls {
                self.executor.enqueue(&SharingAction::RemoveSharedListEntry {
                    local_list_id: list_id,
                    remote_list_id: remote_list_id.clone(),
                    normalized_url: page_url.clone(),
                })?;
                queued += 1;

                // Pages are unique within a list, so this entry was the only
                // link between the page's annotations and this list.
                let annotations = self
                    .collections
                    .annotations_for_pages(std::slice::from_ref(&page_url))
                    .await?;
                let local_ids: Vec<AnnotationId> =
                    annotations.into_iter().map(|annotation| annotation.url).collect();
                let remote_annotation_ids: Vec<RemoteId> = self
                    .remote_ids
                    .get_remote_annotation_ids(&local_ids)?
                    .into_values()
                    .collect();
                if !remote_annotation_ids.is_empty() {
                    self.executor
                        .enqueue(&SharingAction::RemoveSharedAnnotationListEntries {
                            remote_list_id: remote_list_id.clone(),
                            remote_annotation_ids,
                        })?;
                    queued += 1;
                }

                self.events
                    .publish(SharingEvent::PageRemovedFromSharedList { page_url });
            }
        }

        Ok(queued)
    }

    fn list_renamed(&self, change: &StorageChange) -> Result<usize> {
        let Some(new_title) = change.string_field("name") else {
            return Ok(0);
        };

        let mut queued = 0;
        for key in &change.primary_keys {
            let PrimaryKey::List(list_id) = key else {
                continue;
            };
            if let Some(remote_list_id) = self.remote_ids.get_remote_list_id(*list_id)? {
                self.executor.enqueue(&SharingAction::ChangeSharedListTitle {
                    local_list_id: *list_id,
                    remote_list_id,
                    new_title: new_title.to_string(),
                })?;
                queued += 1;
            }
        }
        Ok(queued)
    }

    fn annotation_edited(&self, change: &StorageChange) -> Result<usize> {
        if !change.touches("comment") {
            return Ok(0);
        }
        let comment = change.string_field("comment").unwrap_or_default();

        let mut queued = 0;
        for (local_id, remote_id) in self
            .remote_ids
            .get_remote_annotation_ids(&annotation_keys(&change.primary_keys))?
        {
            self.executor.enqueue(&SharingAction::UpdateAnnotationComment {
                local_annotation_id: local_id,
                remote_annotation_id: remote_id,
                updated_comment: comment.to_string(),
            })?;
            queued += 1;
        }
        Ok(queued)
    }

    fn annotations_deleted(&self, change: &StorageChange) -> Result<usize> {
        let mapped = self
            .remote_ids
            .get_remote_annotation_ids(&annotation_keys(&change.primary_keys))?;
        if mapped.is_empty() {
            return Ok(0);
        }

        let local_ids: Vec<AnnotationId> = mapped.keys().cloned().collect();
        self.remote_ids.delete_annotation_mapping(&local_ids)?;
        self.executor.enqueue(&SharingAction::UnshareAnnotations {
            remote_annotation_ids: mapped.into_values().collect(),
        })?;
        Ok(1)
    }

    /// Queue `add-annotation-entries` for the shared ones among `annotations`.
    pub(crate) fn enqueue_annotation_entries(
        &self,
        annotations: &[LocalAnnotation],
        remote_list_ids: Vec<RemoteId>,
    ) -> Result<usize> {
        let local_ids: Vec<AnnotationId> =
            annotations.iter().map(|annotation| annotation.url.clone()).collect();
        let mapped = self.remote_ids.get_remote_annotation_ids(&local_ids)?;

        match annotation_entries(annotations, &mapped, remote_list_ids) {
            Some(action) => {
                self.executor.enqueue(&action)?;
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

fn entries_by_list(keys: &[PrimaryKey]) -> BTreeMap<LocalListId, Vec<String>> {
    let mut by_list: BTreeMap<LocalListId, Vec<String>> = BTreeMap::new();
    for key in keys {
        if let PrimaryKey::ListEntry { list_id, page_url } = key {
            by_list.entry(*list_id).or_default().push(page_url.clone());
        }
    }
    by_list
}

fn annotation_keys(keys: &[PrimaryKey]) -> Vec<AnnotationId> {
    keys.iter()
        .filter_map(|key| match key {
            PrimaryKey::Annotation(id) => Some(id.clone()),
            _ => None,
        })
        .collect()
}

/// `https://` plus the normalized visited URL, or the page URL without one.
fn original_url(page_url: &str, full_url: Option<&str>) -> String {
    let normalized = full_url.and_then(|url| normalize_url(url).ok());
    original_url_for(normalized.as_deref().unwrap_or(page_url))
}
