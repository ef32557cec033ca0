//! Sync executor: drains the action queue against the remote store.
//!
//! At most one drain runs per executor. A drain takes the oldest action,
//! runs it, and removes it only once the remote call succeeded. The first
//! failure stops the drain and schedules a retry from the same action, so
//! actions always reach the remote store in the order they were queued.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use listshare_common::{AnnotationId, Error, LocalListId, RemoteId, Result};
use listshare_remote::{
    AnnotationsByPage, SharedAnnotationEntry, SharedAnnotationReference, SharedListReference, SharingProvider,
    UserReference,
};

use crate::action::SharingAction;
use crate::auth::AuthProvider;
use crate::local::LocalCollections;
use crate::queue::ActionQueue;
use crate::remote_ids::RemoteIdStore;
use crate::retry::RetryPolicy;
use crate::state::{ExecutionOutcome, ExecutionWatch, RetryTimer, SharingState, SharingStatus};

struct ExecutorInner<P: ?Sized> {
    provider: Arc<P>,
    auth: Arc<dyn AuthProvider>,
    collections: Arc<dyn LocalCollections>,
    queue: ActionQueue,
    remote_ids: RemoteIdStore,
    retry: RetryPolicy,
    state: Mutex<SharingState>,
}

/// Runs queued actions. Clones share one queue and one state.
pub struct SyncExecutor<P: SharingProvider + ?Sized> {
    inner: Arc<ExecutorInner<P>>,
}

impl<P: SharingProvider + ?Sized> Clone for SyncExecutor<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

enum Pending {
    Running(ExecutionWatch),
    Started(JoinHandle<Result<usize>>),
}

impl<P: SharingProvider + ?Sized + 'static> SyncExecutor<P> {
    /// Create an executor.
    pub fn new(
        provider: Arc<P>,
        auth: Arc<dyn AuthProvider>,
        collections: Arc<dyn LocalCollections>,
        queue: ActionQueue,
        remote_ids: RemoteIdStore,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                provider,
                auth,
                collections,
                queue,
                remote_ids,
                retry,
                state: Mutex::new(SharingState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SharingState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an action without starting a drain.
    pub fn enqueue(&self, action: &SharingAction) -> Result<i64> {
        let mut state = self.state();
        let id = self.inner.queue.enqueue(action)?;
        state.has_pending_actions = true;
        Ok(id)
    }

    /// Append an action and drain.
    ///
    /// Returns the error of the drain this call drove. When a drain is
    /// already running or a retry is pending, the action just waits its turn.
    pub async fn schedule(&self, action: SharingAction) -> Result<i64> {
        let id = self.enqueue(&action)?;
        self.kick().await?;
        Ok(id)
    }

    /// Drain, unless a drain is running or a retry is pending.
    pub async fn kick(&self) -> Result<()> {
        let handle = {
            let mut state = self.state();
            if state.is_retry_scheduled() {
                debug!("Retry pending, leaving sharing actions queued");
                return Ok(());
            }
            self.begin_execution(&mut state)
        };

        match handle {
            Some(handle) => Self::join(handle).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Drain now, cancelling a pending retry.
    pub async fn execute_pending_actions(&self) -> Result<()> {
        let handle = {
            let mut state = self.state();
            self.begin_execution(&mut state)
        };

        match handle {
            Some(handle) => Self::join(handle).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Wait until the queue has been drained.
    ///
    /// Joins the running drain if there is one, starts one if actions are
    /// queued, and returns at once on an empty queue.
    pub async fn wait_for_sync(&self) -> Result<()> {
        let pending = {
            let mut state = self.state();
            match state.executing.clone() {
                Some(watch) => Pending::Running(watch),
                None => {
                    if self.inner.queue.is_empty()? {
                        return Ok(());
                    }
                    state.has_pending_actions = true;
                    match self.begin_execution(&mut state) {
                        Some(handle) => Pending::Started(handle),
                        None => return Ok(()),
                    }
                }
            }
        };

        match pending {
            Pending::Running(watch) => Self::await_outcome(watch).await,
            Pending::Started(handle) => Self::join(handle).await.map(|_| ()),
        }
    }

    /// Resume work left in the queue by an earlier session.
    ///
    /// Failures are logged; the retry timer takes over from there.
    pub async fn setup(&self) {
        match self.inner.queue.len() {
            Ok(0) => debug!("No pending sharing actions"),
            Ok(count) => {
                info!("Resuming {} pending sharing actions", count);
                self.state().has_pending_actions = true;
                if let Err(e) = self.execute_pending_actions().await {
                    error!("Failed to resume pending sharing actions: {}", e);
                }
            }
            Err(e) => error!("Failed to read sharing queue: {}", e),
        }
    }

    /// Cancel a pending retry. A running drain finishes on its own.
    pub fn shutdown(&self) {
        self.state().cancel_retry();
    }

    /// Snapshot of the execution state.
    pub fn status(&self) -> Result<SharingStatus> {
        let queued_actions = self.inner.queue.len()?;
        let (shared_lists, shared_annotations) = self.inner.remote_ids.counts()?;
        let state = self.state();
        Ok(SharingStatus {
            phase: state.phase(),
            has_pending_actions: state.has_pending_actions,
            queued_actions,
            shared_lists,
            shared_annotations,
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.clone(),
            last_synced: state.last_synced,
        })
    }

    fn begin_execution(&self, state: &mut SharingState) -> Option<JoinHandle<Result<usize>>> {
        if state.is_executing() || !state.has_pending_actions {
            return None;
        }
        state.cancel_retry();

        let (sender, watch) = watch::channel(None);
        state.executing = Some(watch);

        let this = self.clone();
        Some(tokio::spawn(async move { this.run_drain(sender).await }))
    }

    async fn join(handle: JoinHandle<Result<usize>>) -> Result<usize> {
        handle
            .await
            .map_err(|e| Error::Channel(format!("Sharing execution task failed: {}", e)))?
    }

    async fn await_outcome(mut watch: ExecutionWatch) -> Result<()> {
        let outcome = (*watch
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Channel("Sharing execution ended without an outcome".to_string()))?)
        .clone();

        match outcome {
            Some(ExecutionOutcome::Failed(message)) => Err(Error::RemoteOperationFailed(message)),
            _ => Ok(()),
        }
    }

    async fn run_drain(self, sender: watch::Sender<Option<ExecutionOutcome>>) -> Result<usize> {
        info!("Draining sharing actions");

        match self.drain().await {
            Ok(executed) => {
                info!("Sharing actions drained ({} executed)", executed);
                sender.send_replace(Some(ExecutionOutcome::Success));
                Ok(executed)
            }
            Err(e) => {
                let message = e.to_string();
                let delay = {
                    let mut state = self.state();
                    state.fail_drain(&message);
                    let delay = self.inner.retry.delay_after(state.consecutive_failures);
                    self.schedule_retry(&mut state, delay);
                    delay
                };
                if e.is_remote() {
                    warn!("Remote sharing call failed: {}. Retrying in {:?}", message, delay);
                } else {
                    error!("Sharing action failed: {}. Retrying in {:?}", message, delay);
                }
                sender.send_replace(Some(ExecutionOutcome::Failed(message)));
                Err(e)
            }
        }
    }

    async fn drain(&self) -> Result<usize> {
        let mut executed = 0;
        loop {
            let next = {
                let mut state = self.state();
                let next = self.inner.queue.peek_oldest()?;
                if next.is_none() {
                    state.finish_drain();
                }
                next
            };
            let Some(queued) = next else {
                return Ok(executed);
            };

            debug!("Executing action {} ({})", queued.id, queued.action.kind());
            self.execute_action(&queued.action).await?;
            self.inner.queue.remove(queued.id)?;
            executed += 1;
        }
    }

    fn schedule_retry(&self, state: &mut SharingState, delay: Duration) {
        state.cancel_retry();
        state.retry_generation += 1;
        let generation = state.retry_generation;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let claimed = this.state().claim_retry(generation);
            if !claimed {
                return;
            }
            info!("Retrying pending sharing actions");
            if let Err(e) = this.execute_pending_actions().await {
                warn!("Retry of sharing actions failed: {}", e);
            }
        });

        state.retry = Some(RetryTimer { generation, handle });
    }

    async fn execute_action(&self, action: &SharingAction) -> Result<()> {
        let user = self.inner.auth.current_user().await?.ok_or_else(|| {
            Error::NotAuthenticated(
                "Tried to execute sharing action without being authenticated".to_string(),
            )
        })?;
        let creator = UserReference::new(user);
        let provider = &self.inner.provider;

        match action {
            SharingAction::AddSharedListEntries {
                remote_list_id,
                data,
                ..
            } => {
                let list = provider.shared_list_reference_from_link_id(remote_list_id)?;
                provider.create_list_entries(&list, data, &creator).await
            }
            SharingAction::RemoveSharedListEntry {
                remote_list_id,
                normalized_url,
                ..
            } => {
                let list = provider.shared_list_reference_from_link_id(remote_list_id)?;
                provider.remove_list_entries(&list, normalized_url).await
            }
            SharingAction::ChangeSharedListTitle {
                remote_list_id,
                new_title,
                ..
            } => {
                let list = provider.shared_list_reference_from_link_id(remote_list_id)?;
                provider.update_list_title(&list, new_title).await
            }
            SharingAction::ShareAnnotations { data, .. } => {
                let list_ids = self.current_list_ids(data).await?;
                let lists = self.shared_list_references(&list_ids)?;
                let references = provider.create_annotations(&creator, &lists, data).await?;
                let remote_ids: BTreeMap<AnnotationId, RemoteId> = references
                    .iter()
                    .map(|(local_id, reference)| {
                        (local_id.clone(), provider.shared_annotation_link_id(reference))
                    })
                    .collect();
                self.inner.remote_ids.store_annotation_ids(&remote_ids)
            }
            SharingAction::AddAnnotationEntries {
                remote_list_ids,
                remote_annotations,
            } => {
                let lists = self.list_references(remote_list_ids)?;
                let entries = remote_annotations
                    .iter()
                    .map(|annotation| {
                        Ok(SharedAnnotationEntry {
                            created_when: annotation.created_when,
                            normalized_page_url: annotation.normalized_page_url.clone(),
                            reference: provider
                                .shared_annotation_reference_from_link_id(&annotation.remote_id)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                provider
                    .add_annotations_to_lists(&creator, &lists, &entries)
                    .await
            }
            SharingAction::UpdateAnnotationComment {
                remote_annotation_id,
                updated_comment,
                ..
            } => {
                let annotation =
                    provider.shared_annotation_reference_from_link_id(remote_annotation_id)?;
                provider
                    .update_annotation_comment(&annotation, updated_comment)
                    .await
            }
            SharingAction::UnshareAnnotations {
                remote_annotation_ids,
            } => {
                let annotations = self.annotation_references(remote_annotation_ids)?;
                provider.remove_annotations(&annotations).await
            }
            SharingAction::RemoveSharedAnnotationListEntries {
                remote_list_id,
                remote_annotation_ids,
            } => {
                let list = provider.shared_list_reference_from_link_id(remote_list_id)?;
                let annotations = self.annotation_references(remote_annotation_ids)?;
                provider
                    .remove_annotations_from_lists(&[list], &annotations)
                    .await
            }
        }
    }

    /// Lists that hold the annotated pages now.
    ///
    /// Pages may have joined shared lists while the action sat in the queue;
    /// those additions found no annotation mapping to link yet.
    async fn current_list_ids(&self, data: &AnnotationsByPage) -> Result<Vec<LocalListId>> {
        let mut list_ids = BTreeSet::new();
        for page_url in data.keys() {
            list_ids.extend(self.inner.collections.list_ids_for_page(page_url).await?);
        }
        Ok(list_ids.into_iter().collect())
    }

    /// References of the lists that are still shared; others are skipped.
    fn shared_list_references(&self, local_ids: &[LocalListId]) -> Result<Vec<SharedListReference>> {
        let mut lists = Vec::with_capacity(local_ids.len());
        for local_id in local_ids {
            match self.inner.remote_ids.get_remote_list_id(*local_id)? {
                Some(remote_id) => lists.push(
                    self.inner
                        .provider
                        .shared_list_reference_from_link_id(&remote_id)?,
                ),
                None => debug!("List {} is no longer shared, skipping", local_id),
            }
        }
        Ok(lists)
    }

    fn list_references(&self, remote_ids: &[RemoteId]) -> Result<Vec<SharedListReference>> {
        remote_ids
            .iter()
            .map(|id| self.inner.provider.shared_list_reference_from_link_id(id))
            .collect()
    }

    fn annotation_references(&self, remote_ids: &[RemoteId]) -> Result<Vec<SharedAnnotationReference>> {
        remote_ids
            .iter()
            .map(|id| self.inner.provider.shared_annotation_reference_from_link_id(id))
            .collect()
    }
}
