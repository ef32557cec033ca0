//! Read access to the local store, plus an in-memory store for tests and demos.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use listshare_common::{normalize_url, AnnotationId, Error, LocalListId, Result};

use crate::changes::{ChangeFeed, ChangeSource, ChangeType, Collection, PrimaryKey, StorageChange};

/// A local custom list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalList {
    pub id: LocalListId,
    pub name: String,
}

/// A page in a local list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageListEntry {
    pub list_id: LocalListId,
    /// Normalized page URL.
    pub page_url: String,
    /// URL as the user visited it.
    pub full_url: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// A local annotation on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalAnnotation {
    pub url: AnnotationId,
    /// Normalized URL of the annotated page.
    pub page_url: String,
    pub body: Option<String>,
    pub comment: Option<String>,
    pub selector: Option<Value>,
    pub created_when: Option<DateTime<Utc>>,
}

/// Read side of the local store used to build sharing actions.
#[async_trait]
pub trait LocalCollections: Send + Sync {
    /// Fetch a list by id.
    async fn fetch_list(&self, id: LocalListId) -> Result<Option<LocalList>>;

    /// All page entries of a list.
    async fn list_entries(&self, id: LocalListId) -> Result<Vec<PageListEntry>>;

    /// Ids of every list that contains the page.
    async fn list_ids_for_page(&self, page_url: &str) -> Result<Vec<LocalListId>>;

    /// Titles of the given pages, keyed by normalized URL. Untitled pages are absent.
    async fn page_titles(&self, page_urls: &[String]) -> Result<HashMap<String, String>>;

    /// Fetch an annotation by id.
    async fn annotation(&self, id: &AnnotationId) -> Result<Option<LocalAnnotation>>;

    /// All annotations on the given pages.
    async fn annotations_for_pages(&self, page_urls: &[String]) -> Result<Vec<LocalAnnotation>>;
}

/// Content of a new annotation.
#[derive(Debug, Clone, Default)]
pub struct AnnotationContent {
    pub body: Option<String>,
    pub comment: Option<String>,
    pub selector: Option<Value>,
}

impl AnnotationContent {
    /// A highlight with the given text.
    pub fn highlight(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::default()
        }
    }

    /// A note without highlighted text.
    pub fn note(comment: impl Into<String>) -> Self {
        Self {
            comment: Some(comment.into()),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct LocalTables {
    next_list_id: i64,
    next_annotation_id: u64,
    lists: BTreeMap<LocalListId, LocalList>,
    entries: BTreeMap<(LocalListId, String), PageListEntry>,
    page_titles: HashMap<String, String>,
    annotations: BTreeMap<AnnotationId, LocalAnnotation>,
    source: ChangeSource,
}

/// In-memory local store.
///
/// Every mutation is applied first and then published to the attached
/// [`ChangeFeed`], the way a real store reports committed changes.
#[derive(Clone, Default)]
pub struct MemoryCollections {
    tables: Arc<RwLock<LocalTables>>,
    feed: Arc<RwLock<Option<ChangeFeed>>>,
}

impl MemoryCollections {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, LocalTables>> {
        self.tables
            .read()
            .map_err(|_| Error::Storage("Local store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, LocalTables>> {
        self.tables
            .write()
            .map_err(|_| Error::Storage("Local store lock poisoned".to_string()))
    }

    /// Publish mutations to `feed` from now on.
    pub fn set_change_feed(&self, feed: ChangeFeed) {
        if let Ok(mut current) = self.feed.write() {
            *current = Some(feed);
        }
    }

    /// Mark subsequent mutations as coming from `source`.
    pub fn set_change_source(&self, source: ChangeSource) -> Result<()> {
        self.write()?.source = source;
        Ok(())
    }

    fn emit(&self, change: StorageChange) -> Result<()> {
        let feed = self
            .feed
            .read()
            .map_err(|_| Error::Storage("Change feed lock poisoned".to_string()))?
            .clone();
        match feed {
            Some(feed) => feed.notify(change),
            None => Ok(()),
        }
    }

    /// Record a visited page and its title. Returns the normalized URL.
    pub fn add_page(&self, full_url: &str, title: &str) -> Result<String> {
        let page_url = normalize_url(full_url)?;
        self.write()?
            .page_titles
            .insert(page_url.clone(), title.to_string());
        Ok(page_url)
    }

    /// Create a list.
    pub fn create_list(&self, name: &str) -> Result<LocalListId> {
        let (id, source) = {
            let mut tables = self.write()?;
            tables.next_list_id += 1;
            let id = LocalListId(tables.next_list_id);
            tables.lists.insert(
                id,
                LocalList {
                    id,
                    name: name.to_string(),
                },
            );
            (id, tables.source)
        };

        self.emit(
            StorageChange::new(Collection::CustomLists, ChangeType::Create, vec![PrimaryKey::List(id)])
                .with_field("name", name)
                .with_source(source),
        )?;
        Ok(id)
    }

    /// Rename a list.
    pub fn rename_list(&self, id: LocalListId, name: &str) -> Result<()> {
        let source = {
            let mut tables = self.write()?;
            let list = tables
                .lists
                .get_mut(&id)
                .ok_or_else(|| Error::EntityNotFound(format!("list {}", id)))?;
            list.name = name.to_string();
            tables.source
        };

        self.emit(
            StorageChange::new(Collection::CustomLists, ChangeType::Modify, vec![PrimaryKey::List(id)])
                .with_field("name", name)
                .with_source(source),
        )
    }

    /// Add a page to a list. Returns the normalized page URL.
    ///
    /// Adding a page that is already in the list changes nothing.
    pub fn insert_page_to_list(&self, id: LocalListId, full_url: &str) -> Result<String> {
        let page_url = normalize_url(full_url)?;
        let source = {
            let mut tables = self.write()?;
            if !tables.lists.contains_key(&id) {
                return Err(Error::EntityNotFound(format!("list {}", id)));
            }
            let key = (id, page_url.clone());
            if tables.entries.contains_key(&key) {
                return Ok(page_url);
            }
            tables.entries.insert(
                key,
                PageListEntry {
                    list_id: id,
                    page_url: page_url.clone(),
                    full_url: full_url.to_string(),
                    created_at: Some(Utc::now()),
                },
            );
            tables.source
        };

        self.emit(
            StorageChange::new(
                Collection::PageListEntries,
                ChangeType::Create,
                vec![PrimaryKey::ListEntry {
                    list_id: id,
                    page_url: page_url.clone(),
                }],
            )
            .with_field("fullUrl", full_url)
            .with_source(source),
        )?;
        Ok(page_url)
    }

    /// Remove a page from a list.
    pub fn remove_page_from_list(&self, id: LocalListId, url: &str) -> Result<()> {
        let page_url = normalize_url(url)?;
        let source = {
            let mut tables = self.write()?;
            if tables.entries.remove(&(id, page_url.clone())).is_none() {
                return Err(Error::EntityNotFound(format!(
                    "entry for {} in list {}",
                    page_url, id
                )));
            }
            tables.source
        };

        self.emit(
            StorageChange::new(
                Collection::PageListEntries,
                ChangeType::Delete,
                vec![PrimaryKey::ListEntry {
                    list_id: id,
                    page_url,
                }],
            )
            .with_source(source),
        )
    }

    /// Annotate a page.
    pub fn create_annotation(&self, page_url: &str, content: AnnotationContent) -> Result<AnnotationId> {
        let page_url = normalize_url(page_url)?;
        let (id, source) = {
            let mut tables = self.write()?;
            tables.next_annotation_id += 1;
            let id = AnnotationId::new(format!("{}/#{}", page_url, tables.next_annotation_id));
            tables.annotations.insert(
                id.clone(),
                LocalAnnotation {
                    url: id.clone(),
                    page_url,
                    body: content.body,
                    comment: content.comment,
                    selector: content.selector,
                    created_when: Some(Utc::now()),
                },
            );
            (id, tables.source)
        };

        self.emit(
            StorageChange::new(
                Collection::Annotations,
                ChangeType::Create,
                vec![PrimaryKey::Annotation(id.clone())],
            )
            .with_source(source),
        )?;
        Ok(id)
    }

    /// Replace an annotation's comment.
    pub fn edit_annotation_comment(&self, id: &AnnotationId, comment: &str) -> Result<()> {
        let source = {
            let mut tables = self.write()?;
            let annotation = tables
                .annotations
                .get_mut(id)
                .ok_or_else(|| Error::EntityNotFound(format!("annotation {}", id)))?;
            annotation.comment = Some(comment.to_string());
            tables.source
        };

        self.emit(
            StorageChange::new(
                Collection::Annotations,
                ChangeType::Modify,
                vec![PrimaryKey::Annotation(id.clone())],
            )
            .with_field("comment", comment)
            .with_source(source),
        )
    }

    /// Delete an annotation.
    pub fn delete_annotation(&self, id: &AnnotationId) -> Result<()> {
        let source = {
            let mut tables = self.write()?;
            if tables.annotations.remove(id).is_none() {
                return Err(Error::EntityNotFound(format!("annotation {}", id)));
            }
            tables.source
        };

        self.emit(
            StorageChange::new(
                Collection::Annotations,
                ChangeType::Delete,
                vec![PrimaryKey::Annotation(id.clone())],
            )
            .with_source(source),
        )
    }
}

#[async_trait]
impl LocalCollections for MemoryCollections {
    async fn fetch_list(&self, id: LocalListId) -> Result<Option<LocalList>> {
        Ok(self.read()?.lists.get(&id).cloned())
    }

    async fn list_entries(&self, id: LocalListId) -> Result<Vec<PageListEntry>> {
        Ok(self
            .read()?
            .entries
            .values()
            .filter(|entry| entry.list_id == id)
            .cloned()
            .collect())
    }

    async fn list_ids_for_page(&self, page_url: &str) -> Result<Vec<LocalListId>> {
        Ok(self
            .read()?
            .entries
            .keys()
            .filter(|(_, url)| url == page_url)
            .map(|(list_id, _)| *list_id)
            .collect())
    }

    async fn page_titles(&self, page_urls: &[String]) -> Result<HashMap<String, String>> {
        let tables = self.read()?;
        Ok(page_urls
            .iter()
            .filter_map(|url| {
                tables
                    .page_titles
                    .get(url)
                    .map(|title| (url.clone(), title.clone()))
            })
            .collect())
    }

    async fn annotation(&self, id: &AnnotationId) -> Result<Option<LocalAnnotation>> {
        Ok(self.read()?.annotations.get(id).cloned())
    }

    async fn annotations_for_pages(&self, page_urls: &[String]) -> Result<Vec<LocalAnnotation>> {
        Ok(self
            .read()?
            .annotations
            .values()
            .filter(|annotation| page_urls.contains(&annotation.page_url))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::DetectorMessage;

    fn next_change(rx: &mut crate::changes::ChangeFeedReceiver) -> StorageChange {
        match rx.try_recv() {
            Ok(DetectorMessage::Change(change)) => change,
            other => panic!("expected a change, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_entries_and_lookups() {
        let store = MemoryCollections::new();
        store.add_page("https://www.eggs.com/foo", "Eggs.com title").unwrap();
        let list = store.create_list("My list").unwrap();
        let other = store.create_list("Other list").unwrap();

        store.insert_page_to_list(list, "https://www.eggs.com/foo").unwrap();
        store.insert_page_to_list(list, "https://spam.com/foo").unwrap();
        store.insert_page_to_list(other, "https://www.eggs.com/foo").unwrap();

        let entries = store.list_entries(list).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].page_url, "eggs.com/foo");
        assert_eq!(entries[0].full_url, "https://www.eggs.com/foo");

        let lists = store.list_ids_for_page("eggs.com/foo").await.unwrap();
        assert_eq!(lists, vec![list, other]);

        let titles = store
            .page_titles(&["eggs.com/foo".to_string(), "spam.com/foo".to_string()])
            .await
            .unwrap();
        assert_eq!(titles.get("eggs.com/foo").map(String::as_str), Some("Eggs.com title"));
        assert!(!titles.contains_key("spam.com/foo"));
    }

    #[tokio::test]
    async fn test_annotations_by_page() {
        let store = MemoryCollections::new();
        let first = store
            .create_annotation("https://www.eggs.com/foo", AnnotationContent::highlight("hi"))
            .unwrap();
        store
            .create_annotation("https://spam.com/foo", AnnotationContent::note("note"))
            .unwrap();

        let found = store
            .annotations_for_pages(&["eggs.com/foo".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].url, first);
        assert_eq!(found[0].body.as_deref(), Some("hi"));

        store.edit_annotation_comment(&first, "edited").unwrap();
        let annotation = store.annotation(&first).await.unwrap().unwrap();
        assert_eq!(annotation.comment.as_deref(), Some("edited"));

        store.delete_annotation(&first).unwrap();
        assert!(store.annotation(&first).await.unwrap().is_none());
    }

    #[test]
    fn test_mutations_emit_changes() {
        let store = MemoryCollections::new();
        let (feed, mut rx) = ChangeFeed::channel();
        store.set_change_feed(feed);

        let list = store.create_list("My list").unwrap();
        let created = next_change(&mut rx);
        assert_eq!(created.collection, Collection::CustomLists);

        store.insert_page_to_list(list, "https://www.eggs.com/foo").unwrap();
        let inserted = next_change(&mut rx);
        assert_eq!(inserted.change_type, ChangeType::Create);
        assert_eq!(inserted.string_field("fullUrl"), Some("https://www.eggs.com/foo"));
        assert_eq!(
            inserted.primary_keys,
            vec![PrimaryKey::ListEntry {
                list_id: list,
                page_url: "eggs.com/foo".to_string()
            }]
        );

        // Re-adding the same page is silent.
        store.insert_page_to_list(list, "http://eggs.com/foo").unwrap();
        assert!(rx.try_recv().is_err());

        store.set_change_source(ChangeSource::Sync).unwrap();
        store.rename_list(list, "Renamed").unwrap();
        let renamed = next_change(&mut rx);
        assert_eq!(renamed.source, ChangeSource::Sync);
        assert_eq!(renamed.string_field("name"), Some("Renamed"));
    }

    #[test]
    fn test_missing_entities() {
        let store = MemoryCollections::new();

        let result = store.insert_page_to_list(LocalListId(9), "https://eggs.com");
        assert!(matches!(result, Err(Error::EntityNotFound(_))));

        let list = store.create_list("My list").unwrap();
        let result = store.remove_page_from_list(list, "https://eggs.com");
        assert!(matches!(result, Err(Error::EntityNotFound(_))));

        let result = store.delete_annotation(&AnnotationId::new("eggs.com/#1"));
        assert!(matches!(result, Err(Error::EntityNotFound(_))));
    }
}
