//! Durable FIFO queue of sharing actions.
//!
//! Actions are peeked, executed and only then removed, so a crash between
//! execution and removal replays the action on the next start.

use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::debug;

use listshare_common::{Error, Result};

use crate::action::{QueuedAction, SharingAction};
use crate::db::SharingDatabase;

/// The pending action queue.
#[derive(Clone)]
pub struct ActionQueue {
    db: SharingDatabase,
}

impl ActionQueue {
    /// Use the queue table of `db`.
    pub fn new(db: SharingDatabase) -> Self {
        Self { db }
    }

    /// Append an action. It is durable when this returns.
    pub fn enqueue(&self, action: &SharingAction) -> Result<i64> {
        let json = action.to_json()?;
        let queued_at = Utc::now().timestamp_millis();

        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sharing_actions (action, queued_at) VALUES (?1, ?2)",
                params![json, queued_at],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        debug!("Queued {} as action {}", action.kind(), id);
        Ok(id)
    }

    /// The oldest pending action, without removing it.
    pub fn peek_oldest(&self) -> Result<Option<QueuedAction>> {
        let row = self.db.with_conn(|conn| {
            let row = conn.query_row(
                "SELECT id, action, queued_at FROM sharing_actions ORDER BY id ASC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?)),
            );
            match row {
                Ok(row) => Ok(Some(row)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })?;

        row.map(decode_row).transpose()
    }

    /// Remove an executed action.
    pub fn remove(&self, id: i64) -> Result<()> {
        let removed = self
            .db
            .with_conn(|conn| conn.execute("DELETE FROM sharing_actions WHERE id = ?1", [id]))?;
        if removed == 0 {
            debug!("Action {} was already removed", id);
        }
        Ok(())
    }

    /// Number of pending actions.
    pub fn len(&self) -> Result<u64> {
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM sharing_actions", [], |row| row.get(0))
        })?;
        Ok(count as u64)
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every pending action, oldest first.
    pub fn all(&self) -> Result<Vec<QueuedAction>> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, action, queued_at FROM sharing_actions ORDER BY id ASC")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<rusqlite::Result<Vec<(i64, String, i64)>>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(decode_row).collect()
    }
}

fn decode_row((id, json, queued_at): (i64, String, i64)) -> Result<QueuedAction> {
    let queued_at = DateTime::<Utc>::from_timestamp_millis(queued_at)
        .ok_or_else(|| Error::Storage(format!("Action {} has an invalid timestamp", id)))?;
    Ok(QueuedAction {
        id,
        queued_at,
        action: SharingAction::from_json(&json)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use listshare_common::{LocalListId, RemoteId};
    use proptest::prelude::*;

    fn title_change(title: &str) -> SharingAction {
        SharingAction::ChangeSharedListTitle {
            local_list_id: LocalListId(1),
            remote_list_id: RemoteId::new("1").unwrap(),
            new_title: title.to_string(),
        }
    }

    fn queue() -> ActionQueue {
        ActionQueue::new(SharingDatabase::in_memory().unwrap())
    }

    #[test]
    fn test_peek_does_not_remove() {
        let queue = queue();
        assert!(queue.peek_oldest().unwrap().is_none());

        let id = queue.enqueue(&title_change("first")).unwrap();
        queue.enqueue(&title_change("second")).unwrap();

        let head = queue.peek_oldest().unwrap().unwrap();
        assert_eq!(head.id, id);
        assert_eq!(head.action, title_change("first"));
        assert_eq!(queue.peek_oldest().unwrap().unwrap().id, id);
        assert_eq!(queue.len().unwrap(), 2);

        queue.remove(id).unwrap();
        assert_eq!(queue.peek_oldest().unwrap().unwrap().action, title_change("second"));
    }

    #[test]
    fn test_remove_twice_is_harmless() {
        let queue = queue();
        let id = queue.enqueue(&title_change("first")).unwrap();

        queue.remove(id).unwrap();
        queue.remove(id).unwrap();
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_ids_not_reused_after_drain() {
        let queue = queue();
        let first = queue.enqueue(&title_change("first")).unwrap();
        queue.remove(first).unwrap();

        let second = queue.enqueue(&title_change("second")).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sharing.db");

        let queue = ActionQueue::new(SharingDatabase::open(&path).unwrap());
        queue.enqueue(&title_change("first")).unwrap();
        queue.enqueue(&title_change("second")).unwrap();
        drop(queue);

        let queue = ActionQueue::new(SharingDatabase::open(&path).unwrap());
        let titles: Vec<SharingAction> = queue.all().unwrap().into_iter().map(|q| q.action).collect();
        assert_eq!(titles, vec![title_change("first"), title_change("second")]);
    }

    #[test]
    fn test_corrupt_row_is_an_error() {
        let db = SharingDatabase::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sharing_actions (action, queued_at) VALUES ('not json', 0)",
                [],
            )
        })
        .unwrap();

        let queue = ActionQueue::new(db);
        assert!(matches!(queue.peek_oldest(), Err(Error::Serialization(_))));
    }

    proptest! {
        #[test]
        fn drains_in_enqueue_order(titles in proptest::collection::vec("[a-z]{1,8}", 1..20)) {
            let queue = queue();
            for title in &titles {
                queue.enqueue(&title_change(title)).unwrap();
            }

            let mut drained = Vec::new();
            while let Some(head) = queue.peek_oldest().unwrap() {
                if let SharingAction::ChangeSharedListTitle { new_title, .. } = &head.action {
                    drained.push(new_title.clone());
                }
                queue.remove(head.id).unwrap();
            }
            prop_assert_eq!(drained, titles);
        }
    }
}
