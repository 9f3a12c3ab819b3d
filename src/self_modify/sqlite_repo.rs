//! SQLite-backed [`ProposalRepository`].
//!
//! Records are stored as JSON documents next to the few columns that are
//! queried on (`status`, `proposed_at_ms`, `proposal_id`).  Every
//! read-modify-write runs in a `BEGIN IMMEDIATE` transaction, which takes the
//! database write lock up front, so the status compare-and-set and the
//! overlapping-apply check hold across processes sharing the file.  A writer
//! that finds the lock taken waits up to [`BUSY_TIMEOUT`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::StoreError;
use crate::self_modify::gateway::RevisionToken;
use crate::self_modify::proposal::{ModificationProposal, ProposalStatus};
use crate::self_modify::repository::{
    apply_status_update, check_apply_overlap, sort_listing, sort_points, ProposalRepository,
    StatusUpdate,
};
use crate::self_modify::rollback::RollbackPoint;

pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;

CREATE TABLE IF NOT EXISTS proposals (
  id TEXT PRIMARY KEY,
  status TEXT NOT NULL,
  proposed_at_ms INTEGER NOT NULL,
  record TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS proposals_status ON proposals(status);

CREATE TABLE IF NOT EXISTS rollback_points (
  id TEXT PRIMARY KEY,
  proposal_id TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  record TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS rollback_points_proposal ON rollback_points(proposal_id);
"#;

#[derive(Debug)]
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn)
    }

    /// Private in-memory database; nothing survives the process.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(target: "autopatch::sqlite", "schema ready");
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn load_proposal(conn: &Connection, id: &str) -> Result<Option<ModificationProposal>, StoreError> {
    let raw: Option<String> = conn
        .query_row("SELECT record FROM proposals WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    match raw {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

fn load_by_status(
    conn: &Connection,
    status: ProposalStatus,
) -> Result<Vec<ModificationProposal>, StoreError> {
    let mut stmt = conn.prepare("SELECT record FROM proposals WHERE status = ?1")?;
    let rows = stmt.query_map(params![status.as_str()], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(serde_json::from_str(&row?)?);
    }
    Ok(out)
}

fn store_proposal(conn: &Connection, p: &ModificationProposal) -> Result<(), StoreError> {
    let json = serde_json::to_string(p)?;
    conn.execute(
        "UPDATE proposals SET status = ?2, record = ?3 WHERE id = ?1",
        params![p.id, p.status.as_str(), json],
    )?;
    Ok(())
}

impl SqliteRepository {
    fn modify(
        &self,
        id: &str,
        f: impl FnOnce(&Connection, &mut ModificationProposal) -> Result<(), StoreError>,
    ) -> Result<ModificationProposal, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut record =
            load_proposal(&tx, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(&tx, &mut record)?;
        store_proposal(&tx, &record)?;
        tx.commit()?;
        Ok(record)
    }
}

impl ProposalRepository for SqliteRepository {
    fn create(&self, proposal: &ModificationProposal) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM proposals WHERE id = ?1", params![proposal.id], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::Duplicate(proposal.id.clone()));
        }
        let json = serde_json::to_string(proposal)?;
        tx.execute(
            "INSERT INTO proposals (id, status, proposed_at_ms, record) VALUES (?1, ?2, ?3, ?4)",
            params![
                proposal.id,
                proposal.status.as_str(),
                proposal.timestamps.proposed_at_ms as i64,
                json
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<ModificationProposal>, StoreError> {
        let conn = self.conn()?;
        load_proposal(&conn, id)
    }

    fn update_status(
        &self,
        id: &str,
        update: &StatusUpdate,
    ) -> Result<ModificationProposal, StoreError> {
        self.modify(id, |conn, record| {
            apply_status_update(record, update)?;
            if update.next == ProposalStatus::Applying {
                check_apply_overlap(record, &load_by_status(conn, ProposalStatus::Applying)?)?;
            }
            Ok(())
        })
    }

    fn list(&self, status: Option<ProposalStatus>) -> Result<Vec<ModificationProposal>, StoreError> {
        let conn = self.conn()?;
        let mut out = match status {
            Some(s) => load_by_status(&conn, s)?,
            None => {
                let mut stmt = conn.prepare("SELECT record FROM proposals")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                let mut all = Vec::new();
                for row in rows {
                    all.push(serde_json::from_str(&row?)?);
                }
                all
            }
        };
        sort_listing(&mut out);
        Ok(out)
    }

    fn attach_review(&self, id: &str, review_id: &str) -> Result<(), StoreError> {
        self.modify(id, |_, record| {
            record.review_id = Some(review_id.to_string());
            Ok(())
        })
        .map(|_| ())
    }

    fn refresh_base_revisions(
        &self,
        id: &str,
        revisions: BTreeMap<String, Option<RevisionToken>>,
    ) -> Result<(), StoreError> {
        self.modify(id, |_, record| {
            record.base_revisions = revisions;
            Ok(())
        })
        .map(|_| ())
    }

    fn save_rollback_point(&self, point: &RollbackPoint) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let json = serde_json::to_string(point)?;
        conn.execute(
            "INSERT INTO rollback_points (id, proposal_id, created_at_ms, record)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET record = excluded.record",
            params![point.id, point.proposal_id, point.created_at_ms as i64, json],
        )?;
        Ok(())
    }

    fn get_rollback_point(&self, id: &str) -> Result<Option<RollbackPoint>, StoreError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT record FROM rollback_points WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn list_rollback_points(&self) -> Result<Vec<RollbackPoint>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT record FROM rollback_points")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        sort_points(&mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::self_modify::repository::tests::sample;

    #[test]
    fn test_in_memory_round_trip() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let p = sample("p1", ProposalStatus::Pending, 7);
        repo.create(&p).unwrap();
        assert_eq!(repo.get("p1").unwrap().unwrap(), p);
    }

    #[test]
    fn test_status_column_tracks_record() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        repo.create(&sample("p1", ProposalStatus::Pending, 7)).unwrap();
        repo.update_status(
            "p1",
            &StatusUpdate::new(ProposalStatus::Pending, ProposalStatus::Approved, 9),
        )
        .unwrap();
        assert!(repo.list_pending().unwrap().is_empty());
        assert_eq!(repo.list(Some(ProposalStatus::Approved)).unwrap().len(), 1);
    }

    #[test]
    fn test_applying_overlap_is_checked_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("shared.db");
        let first = SqliteRepository::open(&db).unwrap();
        let second = SqliteRepository::open(&db).unwrap();
        first.create(&sample("a", ProposalStatus::Approved, 1)).unwrap();
        first.create(&sample("b", ProposalStatus::Approved, 2)).unwrap();

        let start = StatusUpdate::new(ProposalStatus::Approved, ProposalStatus::Applying, 10);
        first.update_status("a", &start).unwrap();
        let err = second.update_status("b", &start).unwrap_err();
        assert!(matches!(err, StoreError::PathBusy { ref holder, .. } if holder == "a"));
        assert_eq!(first.get("b").unwrap().unwrap().status, ProposalStatus::Approved);
    }

    #[test]
    fn test_stale_update_rolls_back_transaction() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        repo.create(&sample("p1", ProposalStatus::Pending, 7)).unwrap();
        let err = repo
            .update_status(
                "p1",
                &StatusUpdate::new(ProposalStatus::Approved, ProposalStatus::Applying, 9),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleStatus { .. }));
        assert_eq!(repo.get("p1").unwrap().unwrap().status, ProposalStatus::Pending);
    }
}
