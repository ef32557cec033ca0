//! Content sharing session: the public API over queue, executor and detector.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use listshare_common::{AnnotationId, Error, LocalListId, RemoteId, Result, UserId};
use listshare_remote::{
    AnnotationsByPage, SharedAnnotationData, SharedListData, SharedListEntryData, SharingProvider,
    UserReference,
};

use crate::action::{list_entry_batches, QueuedAction, SharingAction};
use crate::auth::AuthProvider;
use crate::changes::{ChangeFeed, StorageChange};
use crate::config::SharingConfig;
use crate::db::SharingDatabase;
use crate::detector::ChangeDetector;
use crate::events::{EventHub, EventSubscription};
use crate::executor::SyncExecutor;
use crate::local::LocalCollections;
use crate::queue::ActionQueue;
use crate::remote_ids::{RemoteIdMapping, RemoteIdStore};
use crate::state::SharingStatus;

/// Unique handle identifying a sharing session in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(String);

impl SessionHandle {
    /// Generate a new unique session handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the handle string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sharing of local lists and annotations with a remote store.
///
/// Sharing a list creates the remote list right away so its id is known.
/// Everything else is queued durably and pushed in order by the executor;
/// local edits to shared content are picked up by the change detector.
pub struct ContentSharing<P: SharingProvider + ?Sized> {
    session: SessionHandle,
    config: SharingConfig,
    provider: Arc<P>,
    collections: Arc<dyn LocalCollections>,
    auth: Arc<dyn AuthProvider>,
    queue: ActionQueue,
    remote_ids: RemoteIdStore,
    executor: SyncExecutor<P>,
    detector: ChangeDetector<P>,
    events: EventHub,
    process_sync_changes: Arc<AtomicBool>,
    background: Mutex<Option<(ChangeFeed, JoinHandle<()>)>>,
}

impl<P: SharingProvider + ?Sized + 'static> ContentSharing<P> {
    /// Create a session over `db`.
    ///
    /// # Errors
    /// - The configuration is invalid
    pub fn new(
        provider: Arc<P>,
        collections: Arc<dyn LocalCollections>,
        auth: Arc<dyn AuthProvider>,
        db: SharingDatabase,
        config: SharingConfig,
    ) -> Result<Self> {
        config.validate()?;

        let queue = ActionQueue::new(db.clone());
        let remote_ids = RemoteIdStore::new(db);
        let executor = SyncExecutor::new(
            provider.clone(),
            auth.clone(),
            collections.clone(),
            queue.clone(),
            remote_ids.clone(),
            config.retry.clone(),
        );
        let events = EventHub::new(
            config.event_replay_window,
            config.event_replay_capacity,
            config.event_channel_capacity,
        );
        let process_sync_changes = Arc::new(AtomicBool::new(config.process_sync_changes));
        let detector = ChangeDetector::new(
            executor.clone(),
            remote_ids.clone(),
            collections.clone(),
            events.clone(),
            config.chunk_size,
            process_sync_changes.clone(),
        );

        let session = SessionHandle::new();
        debug!(session = session.as_str(), "Sharing session created with {} provider", provider.name());

        Ok(Self {
            session,
            config,
            provider,
            collections,
            auth,
            queue,
            remote_ids,
            executor,
            detector,
            events,
            process_sync_changes,
            background: Mutex::new(None),
        })
    }

    /// Open a session backed by the database file at `path`.
    pub fn open(
        provider: Arc<P>,
        collections: Arc<dyn LocalCollections>,
        auth: Arc<dyn AuthProvider>,
        path: impl AsRef<Path>,
        config: SharingConfig,
    ) -> Result<Self> {
        Self::new(provider, collections, auth, SharingDatabase::open(path)?, config)
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn config(&self) -> &SharingConfig {
        &self.config
    }

    /// Resume actions left over from an earlier session.
    pub async fn setup(&self) {
        info!(session = self.session.as_str(), "Starting sharing session");
        self.executor.setup().await;
    }

    async fn require_user(&self) -> Result<UserId> {
        self.auth.current_user().await?.ok_or_else(|| {
            Error::NotAuthenticated("Tried to share content without being authenticated".to_string())
        })
    }

    /// Share a list. Returns its remote id.
    ///
    /// The remote list is created before this returns. Sharing a list that is
    /// already shared returns the existing id.
    ///
    /// # Errors
    /// - `NotAuthenticated` without a signed-in user
    /// - `EntityNotFound` if the list does not exist
    pub async fn share_list(&self, list_id: LocalListId) -> Result<RemoteId> {
        let user = self.require_user().await?;
        let list = self.collections.fetch_list(list_id).await?.ok_or_else(|| {
            Error::EntityNotFound(format!("Tried to share non-existing list: {}", list_id))
        })?;

        if let Some(remote_list_id) = self.remote_ids.get_remote_list_id(list_id)? {
            debug!("List {} is already shared as {}", list_id, remote_list_id);
            return Ok(remote_list_id);
        }

        let reference = self
            .provider
            .create_shared_list(
                SharedListData {
                    title: list.name,
                    description: None,
                },
                &UserReference::new(user),
                list_id,
            )
            .await?;
        let remote_list_id = self.provider.shared_list_link_id(&reference);
        self.remote_ids.store_list_id(list_id, &remote_list_id)?;

        info!(
            session = self.session.as_str(),
            "Shared list {} as {}", list_id, remote_list_id
        );
        Ok(remote_list_id)
    }

    /// Stop treating a list as shared. The remote list is left in place.
    ///
    /// Sharing the list again afterwards creates a new remote list.
    pub fn unshare_list(&self, list_id: LocalListId) -> Result<()> {
        if self.remote_ids.get_remote_list_id(list_id)?.is_none() {
            return Err(Error::NotShared(format!("List {} is not shared", list_id)));
        }
        self.remote_ids.delete_list_id(list_id)?;
        info!(session = self.session.as_str(), "Unshared list {}", list_id);
        Ok(())
    }

    /// Push every page of a shared list, plus the shared annotations on them.
    ///
    /// # Errors
    /// - `NotAuthenticated` without a signed-in user
    /// - `NotShared` if the list has not been shared
    /// - The error of the drain this call drove
    pub async fn share_list_entries(&self, list_id: LocalListId) -> Result<()> {
        self.require_user().await?;
        let remote_list_id = self.remote_ids.get_remote_list_id(list_id)?.ok_or_else(|| {
            Error::NotShared(format!(
                "Tried to share entries of list {} before sharing the list",
                list_id
            ))
        })?;

        let entries = self.collections.list_entries(list_id).await?;
        let page_urls: Vec<String> = entries.iter().map(|entry| entry.page_url.clone()).collect();
        let titles = self.collections.page_titles(&page_urls).await?;

        let data: Vec<SharedListEntryData> = entries
            .into_iter()
            .map(|entry| SharedListEntryData {
                created_when: entry.created_at,
                entry_title: titles.get(&entry.page_url).cloned(),
                normalized_url: entry.page_url,
                original_url: entry.full_url,
            })
            .collect();
        debug!("Sharing {} entries of list {}", data.len(), list_id);

        for action in list_entry_batches(list_id, &remote_list_id, data, self.config.chunk_size) {
            self.executor.enqueue(&action)?;
        }

        let annotations = self.collections.annotations_for_pages(&page_urls).await?;
        self.detector
            .enqueue_annotation_entries(&annotations, vec![remote_list_id])?;

        self.executor.kick().await
    }

    /// Share an annotation with every shared list that contains its page.
    ///
    /// # Errors
    /// - `NotAuthenticated` without a signed-in user
    /// - `EntityNotFound` if the annotation does not exist
    pub async fn share_annotation(&self, annotation_id: &AnnotationId) -> Result<()> {
        self.require_user().await?;
        let annotation = self
            .collections
            .annotation(annotation_id)
            .await?
            .ok_or_else(|| {
                Error::EntityNotFound(format!(
                    "Tried to share non-existing annotation: {}",
                    annotation_id
                ))
            })?;

        let list_ids = self
            .collections
            .list_ids_for_page(&annotation.page_url)
            .await?;
        let shared = self.remote_ids.are_lists_shared(&list_ids)?;
        let local_list_ids: Vec<LocalListId> = list_ids
            .into_iter()
            .filter(|id| shared.get(id).copied().unwrap_or(false))
            .collect();

        let mut data = AnnotationsByPage::new();
        data.insert(
            annotation.page_url.clone(),
            vec![SharedAnnotationData {
                local_id: annotation.url,
                created_when: annotation.created_when,
                body: annotation.body,
                comment: annotation.comment,
                selector: annotation.selector.map(|selector| selector.to_string()),
            }],
        );

        self.executor
            .schedule(SharingAction::ShareAnnotations {
                local_list_ids,
                data,
            })
            .await
            .map(|_| ())
    }

    /// Unshare an annotation.
    ///
    /// The local mapping is removed before this returns; the remote
    /// annotation and its list entries follow through the queue.
    ///
    /// # Errors
    /// - `NotShared` if the annotation has no remote mapping
    pub async fn unshare_annotation(&self, annotation_id: &AnnotationId) -> Result<()> {
        let ids = std::slice::from_ref(annotation_id);
        let remote_annotation_id = self
            .remote_ids
            .get_remote_annotation_ids(ids)?
            .remove(annotation_id)
            .ok_or_else(|| {
                Error::NotShared(format!(
                    "Tried to unshare an annotation that is not shared: {}",
                    annotation_id
                ))
            })?;

        self.remote_ids.delete_annotation_mapping(ids)?;
        self.executor
            .schedule(SharingAction::UnshareAnnotations {
                remote_annotation_ids: vec![remote_annotation_id],
            })
            .await
            .map(|_| ())
    }

    /// Wait until every queued action has been pushed.
    pub async fn wait_for_sync(&self) -> Result<()> {
        self.executor.wait_for_sync().await
    }

    pub fn get_remote_list_id(&self, list_id: LocalListId) -> Result<Option<RemoteId>> {
        self.remote_ids.get_remote_list_id(list_id)
    }

    pub fn get_remote_annotation_ids(
        &self,
        annotation_ids: &[AnnotationId],
    ) -> Result<std::collections::BTreeMap<AnnotationId, RemoteId>> {
        self.remote_ids.get_remote_annotation_ids(annotation_ids)
    }

    pub fn are_lists_shared(
        &self,
        list_ids: &[LocalListId],
    ) -> Result<std::collections::BTreeMap<LocalListId, bool>> {
        self.remote_ids.are_lists_shared(list_ids)
    }

    /// Every stored remote id mapping.
    pub fn list_mappings(&self) -> Result<Vec<RemoteIdMapping>> {
        self.remote_ids.list_mappings()
    }

    /// Actions still waiting to be pushed, oldest first.
    pub fn pending_actions(&self) -> Result<Vec<QueuedAction>> {
        self.queue.all()
    }

    pub fn status(&self) -> Result<SharingStatus> {
        self.executor.status()
    }

    /// Subscribe to sharing events, starting with recent ones.
    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    /// Whether changes applied by cloud sync are shared.
    pub fn set_process_sync_changes(&self, enabled: bool) {
        self.process_sync_changes.store(enabled, Ordering::SeqCst);
    }

    pub fn process_sync_changes(&self) -> bool {
        self.process_sync_changes.load(Ordering::SeqCst)
    }

    /// Handle one storage change right away, returning any error.
    pub async fn handle_storage_change(&self, change: &StorageChange) -> Result<()> {
        self.detector.handle_change(change).await
    }

    /// Start the background change detector and return its feed.
    ///
    /// Calling this again while the detector runs returns the same feed.
    pub fn spawn_change_detector(&self) -> ChangeFeed {
        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((feed, task)) = background.as_ref() {
            if !task.is_finished() {
                return feed.clone();
            }
        }

        let (feed, rx) = ChangeFeed::channel();
        let task = tokio::spawn(self.detector.clone().run(rx));
        *background = Some((feed.clone(), task));
        feed
    }

    /// The feed of the running change detector, if any.
    pub fn change_feed(&self) -> Option<ChangeFeed> {
        self.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(feed, _)| feed.clone())
    }

    /// Stop the change detector and any pending retry.
    ///
    /// Changes already fed to the detector are handled first. Queued actions
    /// stay in the database for the next session.
    pub async fn shutdown(&self) {
        let background = self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some((feed, task)) = background {
            feed.shutdown();
            let _ = task.await;
        }
        self.executor.shutdown();
        info!(session = self.session.as_str(), "Sharing session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuth;
    use crate::changes::{ChangeSource, ChangeType, Collection, PrimaryKey};
    use crate::events::SharingEvent;
    use crate::local::{AnnotationContent, MemoryCollections};
    use crate::state::SharingPhase;
    use listshare_remote::{MemoryProvider, RemoteOperation};
    use std::time::Duration;

    struct Harness {
        provider: Arc<MemoryProvider>,
        store: MemoryCollections,
        auth: Arc<StaticAuth>,
        sharing: ContentSharing<MemoryProvider>,
    }

    fn user() -> UserId {
        UserId::new("default-user").unwrap()
    }

    fn harness_with(provider: Arc<MemoryProvider>, db: SharingDatabase) -> Harness {
        let store = MemoryCollections::new();
        let auth = Arc::new(StaticAuth::signed_in(user()));
        let sharing = ContentSharing::new(
            provider.clone(),
            Arc::new(store.clone()),
            auth.clone(),
            db,
            SharingConfig::default(),
        )
        .unwrap();
        Harness {
            provider,
            store,
            auth,
            sharing,
        }
    }

    /// A session without a running detector; changes are handled explicitly.
    fn harness() -> Harness {
        harness_with(
            Arc::new(MemoryProvider::new()),
            SharingDatabase::in_memory().unwrap(),
        )
    }

    /// A session whose store feeds a running detector.
    fn live_harness() -> (Harness, ChangeFeed) {
        let harness = harness();
        let feed = harness.sharing.spawn_change_detector();
        harness.store.set_change_feed(feed.clone());
        (harness, feed)
    }

    fn entry_urls(provider: &MemoryProvider) -> Vec<String> {
        provider
            .shared_list_entries()
            .into_iter()
            .map(|entry| entry.normalized_url)
            .collect()
    }

    async fn list_with_pages(harness: &Harness, name: &str, urls: &[&str]) -> LocalListId {
        let list = harness.store.create_list(name).unwrap();
        for url in urls {
            harness.store.insert_page_to_list(list, url).unwrap();
        }
        list
    }

    #[tokio::test]
    async fn test_share_list_with_entries() {
        let harness = harness();
        harness
            .store
            .add_page("https://www.eggs.com/foo", "Eggs.com title")
            .unwrap();
        harness
            .store
            .add_page("https://www.spam.com/foo", "Spam.com title")
            .unwrap();
        let list = list_with_pages(
            &harness,
            "My shared list",
            &["https://www.eggs.com/foo", "https://www.spam.com/foo"],
        )
        .await;

        let remote_list_id = harness.sharing.share_list(list).await.unwrap();
        harness.sharing.share_list_entries(list).await.unwrap();
        harness.sharing.wait_for_sync().await.unwrap();

        let lists = harness.provider.shared_lists();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].title, "My shared list");
        assert_eq!(lists[0].id.to_string(), remote_list_id.as_str());
        assert_eq!(lists[0].creator, user());

        let entries = harness.provider.shared_list_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].normalized_url, "eggs.com/foo");
        assert_eq!(entries[0].original_url, "https://www.eggs.com/foo");
        assert_eq!(entries[0].entry_title.as_deref(), Some("Eggs.com title"));
        assert_eq!(entries[1].normalized_url, "spam.com/foo");
        assert_eq!(entries[1].entry_title.as_deref(), Some("Spam.com title"));

        assert_eq!(
            harness.sharing.get_remote_list_id(list).unwrap(),
            Some(remote_list_id)
        );
    }

    #[tokio::test]
    async fn test_share_list_errors() {
        let harness = harness();
        let result = harness.sharing.share_list(LocalListId(404)).await;
        assert!(matches!(result, Err(Error::EntityNotFound(_))));

        let list = list_with_pages(&harness, "My list", &["https://eggs.com/foo"]).await;
        let result = harness.sharing.share_list_entries(list).await;
        assert!(matches!(result, Err(Error::NotShared(_))));

        harness.auth.set_user(None).unwrap();
        let result = harness.sharing.share_list(list).await;
        assert!(matches!(result, Err(Error::NotAuthenticated(_))));
        assert!(harness.provider.shared_lists().is_empty());
    }

    #[tokio::test]
    async fn test_share_list_twice_keeps_mapping() {
        let harness = harness();
        let list = harness.store.create_list("My list").unwrap();

        let first = harness.sharing.share_list(list).await.unwrap();
        let second = harness.sharing.share_list(list).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(harness.provider.shared_lists().len(), 1);

        harness.sharing.unshare_list(list).unwrap();
        assert!(matches!(
            harness.sharing.unshare_list(list),
            Err(Error::NotShared(_))
        ));
        let third = harness.sharing.share_list(list).await.unwrap();
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn test_entries_are_chunked() {
        let provider = Arc::new(MemoryProvider::new());
        let store = MemoryCollections::new();
        let config = SharingConfig {
            chunk_size: 2,
            ..SharingConfig::default()
        };
        let sharing = ContentSharing::new(
            provider.clone(),
            Arc::new(store.clone()),
            Arc::new(StaticAuth::signed_in(user())),
            SharingDatabase::in_memory().unwrap(),
            config,
        )
        .unwrap();

        let list = store.create_list("Big list").unwrap();
        for i in 0..5 {
            store
                .insert_page_to_list(list, &format!("https://eggs.com/{}", i))
                .unwrap();
        }
        sharing.share_list(list).await.unwrap();
        sharing.share_list_entries(list).await.unwrap();

        let batches = provider
            .calls()
            .into_iter()
            .filter(|op| *op == RemoteOperation::CreateListEntries)
            .count();
        assert_eq!(batches, 3);
        assert_eq!(provider.shared_list_entries().len(), 5);
    }

    #[tokio::test]
    async fn test_annotation_follows_page_into_shared_list() {
        let (harness, feed) = live_harness();
        let list = harness.store.create_list("My list").unwrap();
        harness.sharing.share_list(list).await.unwrap();

        let annotation = harness
            .store
            .create_annotation("https://www.eggs.com/foo", AnnotationContent::highlight("Hello"))
            .unwrap();
        harness.sharing.share_annotation(&annotation).await.unwrap();
        assert_eq!(harness.provider.shared_annotations().len(), 1);
        assert!(harness.provider.shared_annotation_list_entries().is_empty());

        harness
            .store
            .insert_page_to_list(list, "https://www.eggs.com/foo")
            .unwrap();
        feed.flush().await.unwrap();
        harness.sharing.wait_for_sync().await.unwrap();

        assert_eq!(entry_urls(&harness.provider), vec!["eggs.com/foo"]);
        assert_eq!(harness.provider.shared_annotations().len(), 1);
        let links = harness.provider.shared_annotation_list_entries();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].normalized_page_url, "eggs.com/foo");
        assert_eq!(links[0].shared_annotation, harness.provider.shared_annotations()[0].id);

        harness.sharing.shutdown().await;
    }

    #[tokio::test]
    async fn test_share_annotation_in_shared_lists() {
        let harness = harness();
        let shared = list_with_pages(&harness, "Shared", &["https://eggs.com/foo"]).await;
        list_with_pages(&harness, "Private", &["https://eggs.com/foo"]).await;
        harness.sharing.share_list(shared).await.unwrap();

        let annotation = harness
            .store
            .create_annotation(
                "https://eggs.com/foo",
                AnnotationContent {
                    body: Some("quote".to_string()),
                    comment: Some("note".to_string()),
                    selector: Some(serde_json::json!({"quote": "quote"})),
                },
            )
            .unwrap();
        harness.sharing.share_annotation(&annotation).await.unwrap();

        let annotations = harness.provider.shared_annotations();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].comment.as_deref(), Some("note"));
        assert_eq!(annotations[0].selector.as_deref(), Some(r#"{"quote":"quote"}"#));
        assert_eq!(harness.provider.shared_annotation_list_entries().len(), 1);

        let missing = harness
            .sharing
            .share_annotation(&AnnotationId::new("eggs.com/foo/#404"))
            .await;
        assert!(matches!(missing, Err(Error::EntityNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_entries_are_retried() {
        let harness = harness();
        let list = list_with_pages(
            &harness,
            "My list",
            &["https://eggs.com/foo", "https://spam.com/foo"],
        )
        .await;
        harness.sharing.share_list(list).await.unwrap();

        harness
            .provider
            .fail_next(RemoteOperation::CreateListEntries, 1, "Network down");
        let result = harness.sharing.share_list_entries(list).await;
        assert!(matches!(result, Err(Error::RemoteOperationFailed(_))));
        assert!(entry_urls(&harness.provider).is_empty());
        assert_eq!(
            harness.sharing.status().unwrap().phase,
            SharingPhase::RetryScheduled
        );

        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;

        assert_eq!(entry_urls(&harness.provider), vec!["eggs.com/foo", "spam.com/foo"]);
        assert!(harness.sharing.pending_actions().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_removal_is_retried() {
        let harness = harness();
        let list = list_with_pages(
            &harness,
            "My list",
            &["https://eggs.com/foo", "https://spam.com/foo"],
        )
        .await;
        harness.sharing.share_list(list).await.unwrap();
        harness.sharing.share_list_entries(list).await.unwrap();

        harness
            .provider
            .fail_next(RemoteOperation::RemoveListEntries, 1, "Network down");
        harness
            .store
            .remove_page_from_list(list, "https://eggs.com/foo")
            .unwrap();
        let change = StorageChange::new(
            Collection::PageListEntries,
            ChangeType::Delete,
            vec![PrimaryKey::ListEntry {
                list_id: list,
                page_url: "eggs.com/foo".to_string(),
            }],
        );
        let result = harness.sharing.handle_storage_change(&change).await;
        assert!(matches!(result, Err(Error::RemoteOperationFailed(_))));
        assert_eq!(entry_urls(&harness.provider).len(), 2);

        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
        assert_eq!(entry_urls(&harness.provider), vec!["spam.com/foo"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_annotation_links_list_joined_during_retry() {
        let (harness, feed) = live_harness();
        let list = harness.store.create_list("My list").unwrap();
        harness.sharing.share_list(list).await.unwrap();

        let annotation = harness
            .store
            .create_annotation("https://eggs.com/foo", AnnotationContent::highlight("Hello"))
            .unwrap();
        harness
            .provider
            .fail_next(RemoteOperation::CreateAnnotations, 1, "Network down");
        let result = harness.sharing.share_annotation(&annotation).await;
        assert!(matches!(result, Err(Error::RemoteOperationFailed(_))));

        harness
            .store
            .insert_page_to_list(list, "https://eggs.com/foo")
            .unwrap();
        feed.flush().await.unwrap();
        assert_eq!(entry_urls(&harness.provider), Vec::<String>::new());

        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
        harness.sharing.wait_for_sync().await.unwrap();

        assert_eq!(entry_urls(&harness.provider), vec!["eggs.com/foo"]);
        assert_eq!(harness.provider.shared_annotations().len(), 1);
        let links = harness.provider.shared_annotation_list_entries();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].normalized_page_url, "eggs.com/foo");
        assert!(harness.sharing.pending_actions().unwrap().is_empty());

        harness.sharing.shutdown().await;
    }

    #[tokio::test]
    async fn test_unshare_annotation_in_two_lists() {
        let harness = harness();
        let first = list_with_pages(&harness, "First", &["https://eggs.com/foo"]).await;
        let second = list_with_pages(&harness, "Second", &["https://eggs.com/foo"]).await;
        harness.sharing.share_list(first).await.unwrap();
        harness.sharing.share_list(second).await.unwrap();

        let annotation = harness
            .store
            .create_annotation("https://eggs.com/foo", AnnotationContent::highlight("Hello"))
            .unwrap();
        harness.sharing.share_annotation(&annotation).await.unwrap();
        assert_eq!(harness.provider.shared_annotation_list_entries().len(), 2);

        harness
            .provider
            .fail_next(RemoteOperation::RemoveAnnotations, 1, "Network down");
        let result = harness.sharing.unshare_annotation(&annotation).await;
        assert!(result.is_err());
        assert!(harness
            .sharing
            .get_remote_annotation_ids(&[annotation.clone()])
            .unwrap()
            .is_empty());

        harness.sharing.wait_for_sync().await.unwrap();
        assert!(harness.provider.shared_annotations().is_empty());
        assert!(harness.provider.shared_annotation_list_entries().is_empty());

        let again = harness.sharing.unshare_annotation(&annotation).await;
        assert!(matches!(again, Err(Error::NotShared(_))));
    }

    #[tokio::test]
    async fn test_reshare_creates_fresh_mapping() {
        let harness = harness();
        let annotation = harness
            .store
            .create_annotation("https://eggs.com/foo", AnnotationContent::note("note"))
            .unwrap();

        harness.sharing.share_annotation(&annotation).await.unwrap();
        let first = harness
            .sharing
            .get_remote_annotation_ids(&[annotation.clone()])
            .unwrap()[&annotation]
            .clone();

        harness.sharing.unshare_annotation(&annotation).await.unwrap();
        harness.sharing.share_annotation(&annotation).await.unwrap();
        let second = harness
            .sharing
            .get_remote_annotation_ids(&[annotation.clone()])
            .unwrap()[&annotation]
            .clone();

        assert_ne!(first, second);
        assert_eq!(harness.provider.shared_annotations().len(), 1);
    }

    #[tokio::test]
    async fn test_removing_page_detaches_annotations_from_that_list_only() {
        let (harness, feed) = live_harness();
        let first = list_with_pages(&harness, "First", &["https://eggs.com/foo"]).await;
        let second = list_with_pages(&harness, "Second", &["https://eggs.com/foo"]).await;
        let first_remote = harness.sharing.share_list(first).await.unwrap();
        let second_remote = harness.sharing.share_list(second).await.unwrap();
        harness.sharing.share_list_entries(first).await.unwrap();
        harness.sharing.share_list_entries(second).await.unwrap();

        let annotation = harness
            .store
            .create_annotation("https://eggs.com/foo", AnnotationContent::highlight("Hello"))
            .unwrap();
        harness.sharing.share_annotation(&annotation).await.unwrap();
        assert_eq!(harness.provider.shared_annotation_list_entries().len(), 2);

        harness
            .store
            .remove_page_from_list(first, "https://eggs.com/foo")
            .unwrap();
        feed.flush().await.unwrap();
        harness.sharing.wait_for_sync().await.unwrap();

        let links = harness.provider.shared_annotation_list_entries();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].shared_list.to_string(), second_remote.as_str());
        assert_ne!(links[0].shared_list.to_string(), first_remote.as_str());
        assert_eq!(harness.provider.shared_annotations().len(), 1);
        assert_eq!(harness.provider.shared_list_entries().len(), 1);

        harness.sharing.shutdown().await;
    }

    #[tokio::test]
    async fn test_edits_propagate_in_order() {
        let (harness, feed) = live_harness();
        let list = list_with_pages(&harness, "My list", &["https://eggs.com/foo"]).await;
        harness.sharing.share_list(list).await.unwrap();
        let annotation = harness
            .store
            .create_annotation("https://eggs.com/foo", AnnotationContent::highlight("Hello"))
            .unwrap();
        harness.sharing.share_annotation(&annotation).await.unwrap();

        for title in ["First", "Second", "Third"] {
            harness.store.rename_list(list, title).unwrap();
        }
        harness.store.edit_annotation_comment(&annotation, "My comment").unwrap();
        feed.flush().await.unwrap();
        harness.sharing.wait_for_sync().await.unwrap();

        assert_eq!(harness.provider.shared_lists()[0].title, "Third");
        assert_eq!(
            harness.provider.shared_annotations()[0].comment.as_deref(),
            Some("My comment")
        );

        harness.store.delete_annotation(&annotation).unwrap();
        feed.flush().await.unwrap();
        harness.sharing.wait_for_sync().await.unwrap();
        assert!(harness.provider.shared_annotations().is_empty());
        assert!(harness
            .sharing
            .get_remote_annotation_ids(&[annotation])
            .unwrap()
            .is_empty());

        harness.sharing.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_changes_can_be_ignored() {
        let (harness, feed) = live_harness();
        let list = harness.store.create_list("My list").unwrap();
        harness.sharing.share_list(list).await.unwrap();

        harness.sharing.set_process_sync_changes(false);
        assert!(!harness.sharing.process_sync_changes());
        harness.store.set_change_source(ChangeSource::Sync).unwrap();
        harness
            .store
            .insert_page_to_list(list, "https://eggs.com/foo")
            .unwrap();
        feed.flush().await.unwrap();
        harness.sharing.wait_for_sync().await.unwrap();
        assert!(harness.provider.shared_list_entries().is_empty());

        harness.store.set_change_source(ChangeSource::Local).unwrap();
        harness
            .store
            .insert_page_to_list(list, "https://spam.com/foo")
            .unwrap();
        feed.flush().await.unwrap();
        harness.sharing.wait_for_sync().await.unwrap();
        assert_eq!(entry_urls(&harness.provider), vec!["spam.com/foo"]);

        harness.sharing.shutdown().await;
    }

    #[tokio::test]
    async fn test_events_replayed_to_late_subscribers() {
        let (harness, feed) = live_harness();
        let list = harness.store.create_list("My list").unwrap();
        harness.sharing.share_list(list).await.unwrap();

        harness
            .store
            .insert_page_to_list(list, "https://eggs.com/foo")
            .unwrap();
        feed.flush().await.unwrap();
        harness.sharing.wait_for_sync().await.unwrap();

        let mut events = harness.sharing.subscribe();
        assert_eq!(
            events.recv().await,
            Some(SharingEvent::PageAddedToSharedList {
                page_url: "eggs.com/foo".to_string()
            })
        );

        harness
            .store
            .remove_page_from_list(list, "https://eggs.com/foo")
            .unwrap();
        feed.flush().await.unwrap();
        harness.sharing.wait_for_sync().await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(SharingEvent::PageRemovedFromSharedList {
                page_url: "eggs.com/foo".to_string()
            })
        );

        harness.sharing.shutdown().await;
    }

    #[tokio::test]
    async fn test_detector_spawned_once() {
        let harness = harness();
        assert!(harness.sharing.change_feed().is_none());

        let feed = harness.sharing.spawn_change_detector();
        let again = harness.sharing.spawn_change_detector();
        again.flush().await.unwrap();
        assert!(harness.sharing.change_feed().is_some());

        harness.sharing.shutdown().await;
        assert!(feed.is_closed());
        assert!(harness.sharing.change_feed().is_none());
    }

    #[tokio::test]
    async fn test_pending_actions_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sharing.db");
        let provider = Arc::new(MemoryProvider::new());

        let first = harness_with(provider.clone(), SharingDatabase::open(&path).unwrap());
        let list = list_with_pages(&first, "My list", &["https://eggs.com/foo"]).await;
        first.sharing.share_list(list).await.unwrap();
        first.auth.set_user(None).unwrap();
        let result = first.sharing.share_list_entries(list).await;
        assert!(matches!(result, Err(Error::NotAuthenticated(_))));
        assert!(first.sharing.pending_actions().unwrap().is_empty());

        // Queued without draining, as if the app quit mid-way.
        first
            .sharing
            .executor
            .enqueue(&SharingAction::ChangeSharedListTitle {
                local_list_id: list,
                remote_list_id: first.sharing.get_remote_list_id(list).unwrap().unwrap(),
                new_title: "Renamed offline".to_string(),
            })
            .unwrap();
        first.sharing.shutdown().await;
        let pending = first.sharing.pending_actions().unwrap();
        assert_eq!(pending.len(), 1);
        drop(first);

        let second = harness_with(provider.clone(), SharingDatabase::open(&path).unwrap());
        assert_eq!(second.sharing.status().unwrap().queued_actions, 1);
        second.sharing.setup().await;

        assert_eq!(provider.shared_lists()[0].title, "Renamed offline");
        let status = second.sharing.status().unwrap();
        assert_eq!(status.queued_actions, 0);
        assert_eq!(status.shared_lists, 1);
        assert_eq!(status.phase, SharingPhase::Idle);
    }
}
