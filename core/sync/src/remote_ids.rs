//! Local-to-remote id mappings for shared lists and annotations.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use listshare_common::{AnnotationId, LocalListId, RemoteId, Result};

use crate::db::SharingDatabase;

/// Which kind of entity a mapping belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    List,
    Annotation,
}

/// One stored mapping, for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteIdMapping {
    pub kind: EntityKind,
    pub local_id: String,
    pub remote_id: RemoteId,
}

/// Persistent remote id store.
///
/// Only local storage is touched; errors are storage errors.
#[derive(Clone)]
pub struct RemoteIdStore {
    db: SharingDatabase,
}

impl RemoteIdStore {
    /// Use the mapping tables of `db`.
    pub fn new(db: SharingDatabase) -> Self {
        Self { db }
    }

    /// Record the remote id of a shared list.
    pub fn store_list_id(&self, local_id: LocalListId, remote_id: &RemoteId) -> Result<()> {
        debug!("Mapping list {} to remote {}", local_id, remote_id);
        self.db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO shared_list_metadata (local_id, remote_id) VALUES (?1, ?2)
                ON CONFLICT(local_id) DO UPDATE SET remote_id = excluded.remote_id
                "#,
                params![local_id.get(), remote_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// The remote id of a list, if it is shared.
    pub fn get_remote_list_id(&self, local_id: LocalListId) -> Result<Option<RemoteId>> {
        let remote = self.db.with_conn(|conn| {
            let remote = conn.query_row(
                "SELECT remote_id FROM shared_list_metadata WHERE local_id = ?1",
                [local_id.get()],
                |row| row.get::<_, String>(0),
            );
            match remote {
                Ok(remote) => Ok(Some(remote)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })?;

        remote.map(RemoteId::new).transpose()
    }

    /// Whether each of the given lists is shared. Every id gets an answer.
    pub fn are_lists_shared(&self, local_ids: &[LocalListId]) -> Result<BTreeMap<LocalListId, bool>> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT COUNT(*) FROM shared_list_metadata WHERE local_id = ?1")?;
            let mut shared = BTreeMap::new();
            for id in local_ids {
                let count: i64 = stmt.query_row([id.get()], |row| row.get(0))?;
                shared.insert(*id, count > 0);
            }
            Ok(shared)
        })
    }

    /// Forget the mapping of a list, so sharing it again creates a new remote list.
    pub fn delete_list_id(&self, local_id: LocalListId) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM shared_list_metadata WHERE local_id = ?1",
                [local_id.get()],
            )?;
            Ok(())
        })
    }

    /// Record the remote ids of shared annotations in one transaction.
    pub fn store_annotation_ids(&self, ids: &BTreeMap<AnnotationId, RemoteId>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        debug!("Mapping {} annotations", ids.len());
        self.db.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO shared_annotation_metadata (local_id, remote_id) VALUES (?1, ?2)
                ON CONFLICT(local_id) DO UPDATE SET remote_id = excluded.remote_id
                "#,
            )?;
            for (local_id, remote_id) in ids {
                stmt.execute(params![local_id.as_str(), remote_id.as_str()])?;
            }
            Ok(())
        })
    }

    /// Remote ids of the given annotations. Unshared annotations are absent.
    pub fn get_remote_annotation_ids(
        &self,
        local_ids: &[AnnotationId],
    ) -> Result<BTreeMap<AnnotationId, RemoteId>> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT remote_id FROM shared_annotation_metadata WHERE local_id = ?1")?;
            let mut rows = Vec::new();
            for id in local_ids {
                match stmt.query_row([id.as_str()], |row| row.get::<_, String>(0)) {
                    Ok(remote) => rows.push((id.clone(), remote)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(local, remote)| Ok((local, RemoteId::new(remote)?)))
            .collect()
    }

    /// Forget the mappings of the given annotations.
    pub fn delete_annotation_mapping(&self, local_ids: &[AnnotationId]) -> Result<()> {
        self.db.with_transaction(|tx| {
            let mut stmt = tx.prepare("DELETE FROM shared_annotation_metadata WHERE local_id = ?1")?;
            for id in local_ids {
                stmt.execute([id.as_str()])?;
            }
            Ok(())
        })
    }

    /// Every stored mapping, lists first.
    pub fn list_mappings(&self) -> Result<Vec<RemoteIdMapping>> {
        let rows = self.db.with_conn(|conn| {
            let mut rows = Vec::new();

            let mut stmt =
                conn.prepare("SELECT local_id, remote_id FROM shared_list_metadata ORDER BY local_id")?;
            for row in stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))? {
                let (local, remote) = row?;
                rows.push((EntityKind::List, local.to_string(), remote));
            }

            let mut stmt = conn.prepare(
                "SELECT local_id, remote_id FROM shared_annotation_metadata ORDER BY local_id",
            )?;
            for row in stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))? {
                let (local, remote) = row?;
                rows.push((EntityKind::Annotation, local, remote));
            }

            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(kind, local_id, remote)| {
                Ok(RemoteIdMapping {
                    kind,
                    local_id,
                    remote_id: RemoteId::new(remote)?,
                })
            })
            .collect()
    }

    /// Number of shared lists and shared annotations.
    pub fn counts(&self) -> Result<(u64, u64)> {
        self.db.with_conn(|conn| {
            let lists: i64 =
                conn.query_row("SELECT COUNT(*) FROM shared_list_metadata", [], |row| row.get(0))?;
            let annotations: i64 = conn.query_row(
                "SELECT COUNT(*) FROM shared_annotation_metadata",
                [],
                |row| row.get(0),
            )?;
            Ok((lists as u64, annotations as u64))
        })
    }
}
