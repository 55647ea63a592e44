//! SQLite-backed coordination store shared by every broker replica.
//!
//! Each row binds a port to a lease key. A row is either `live` or
//! `reclaiming`; a port is free only when it has no row at all, so a port
//! whose routing rule may still exist can never be handed out again.

use chrono::{DateTime, Utc};
use common::LeaseKey;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS leases (
    port INTEGER PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    state TEXT NOT NULL,
    allocated_at TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    reclaim_token TEXT,
    reclaiming_since_ms INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS leases_live_key
    ON leases (tenant_id, node_id, endpoint) WHERE state = 'live';
CREATE INDEX IF NOT EXISTS leases_expiry ON leases (expires_at_ms);
CREATE TABLE IF NOT EXISTS lease_keys (
    port INTEGER NOT NULL,
    public_key TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    PRIMARY KEY (port, public_key)
);
"#;

const COLUMNS: &str =
    "port, tenant_id, node_id, endpoint, state, allocated_at, expires_at_ms, reclaiming_since_ms";

// Replicas wait this long for the write lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("store task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Live,
    Reclaiming,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Live => "live",
            LeaseState::Reclaiming => "reclaiming",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "live" => LeaseState::Live,
            _ => LeaseState::Reclaiming,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub port: u16,
    pub key: LeaseKey,
    pub state: LeaseState,
    pub allocated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reclaiming_since: Option<DateTime<Utc>>,
}

/// Outcome of a refresh-or-claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Refreshed(u16),
    Claimed(u16),
    Exhausted,
}

/// A reclaiming row and the token of whoever marked it. Only the holder of
/// the current token may delete the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    pub port: u16,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// No live lease for the key.
    Missing,
    /// Another session on the lease is still live, so the port stays leased.
    Shared(u16),
    Reclaiming(Tombstone),
}

pub struct LeaseStore {
    conn: Mutex<Connection>,
}

/// Get the default database path (~/.tunnel-broker/leases.db)
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tunnel-broker")
        .join("leases.db")
}

impl LeaseStore {
    /// Open the database at the given path, creating the directory if needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Refresh the live lease for `key`, or claim the lowest port in `range`
    /// that has no row. Runs as one IMMEDIATE transaction so concurrent
    /// replicas serialize on the write lock; the port primary key rejects any
    /// double claim that slips through.
    ///
    /// Each public key holds its own session on the lease. The lease expires
    /// with its longest-lived session.
    pub fn claim(
        &self,
        key: &LeaseKey,
        public_key: &str,
        range: RangeInclusive<u16>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Claim, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let claim = match live_port(&tx, key)? {
            Some(port) => {
                upsert_session(&tx, port, public_key, expires_at)?;
                tx.execute(
                    "UPDATE leases SET expires_at_ms =
                        (SELECT MAX(expires_at_ms) FROM lease_keys WHERE port = ?1)
                     WHERE port = ?1",
                    params![port],
                )?;
                Claim::Refreshed(port)
            }
            None => match lowest_free(&tx, range)? {
                Some(port) => {
                    tx.execute("DELETE FROM lease_keys WHERE port = ?1", params![port])?;
                    tx.execute(
                        "INSERT INTO leases (port, tenant_id, node_id, endpoint, state, allocated_at, expires_at_ms)
                         VALUES (?1, ?2, ?3, ?4, 'live', ?5, ?6)",
                        params![
                            port,
                            key.tenant_id,
                            key.node_id,
                            key.endpoint,
                            now.to_rfc3339(),
                            expires_at.timestamp_millis(),
                        ],
                    )?;
                    upsert_session(&tx, port, public_key, expires_at)?;
                    Claim::Claimed(port)
                }
                None => Claim::Exhausted,
            },
        };

        tx.commit()?;
        Ok(claim)
    }

    /// End one session (`public_key`) or every session (`None`) of the live
    /// lease for `key`. When no live session remains the row becomes a
    /// tombstone owned by the caller, and the port stays unavailable until
    /// [`LeaseStore::forget`] is called with that tombstone.
    pub fn release(
        &self,
        key: &LeaseKey,
        public_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Release, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(port) = live_port(&tx, key)? else {
            return Ok(Release::Missing);
        };

        let now_ms = now.timestamp_millis();
        if let Some(public_key) = public_key {
            tx.execute(
                "DELETE FROM lease_keys WHERE port = ?1 AND public_key = ?2",
                params![port, public_key],
            )?;
            let remaining: Option<i64> = tx.query_row(
                "SELECT MAX(expires_at_ms) FROM lease_keys WHERE port = ?1 AND expires_at_ms > ?2",
                params![port, now_ms],
                |row| row.get(0),
            )?;
            if let Some(expires_at_ms) = remaining {
                tx.execute(
                    "UPDATE leases SET expires_at_ms = ?1 WHERE port = ?2",
                    params![expires_at_ms, port],
                )?;
                tx.commit()?;
                return Ok(Release::Shared(port));
            }
        }

        let token = new_token();
        tx.execute(
            "UPDATE leases SET state = 'reclaiming', expires_at_ms = MIN(expires_at_ms, ?1),
                reclaim_token = ?2, reclaiming_since_ms = ?1
             WHERE port = ?3",
            params![now_ms, token, port],
        )?;
        tx.commit()?;
        Ok(Release::Reclaiming(Tombstone { port, token }))
    }

    /// Delete a tombstone, making its port free. Fails quietly (returns
    /// false) when another owner has taken the tombstone over since.
    pub fn forget(&self, tombstone: &Tombstone) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let rows = tx.execute(
            "DELETE FROM leases WHERE port = ?1 AND state = 'reclaiming' AND reclaim_token = ?2",
            params![tombstone.port, tombstone.token],
        )?;
        if rows > 0 {
            tx.execute("DELETE FROM lease_keys WHERE port = ?1", params![tombstone.port])?;
        }
        tx.commit()?;
        Ok(rows > 0)
    }

    /// Live rows whose expiry is at or before `now`, plus tombstones marked at
    /// or before `stale_before`. Younger tombstones still belong to the call
    /// that made them.
    pub fn list_expired(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<LeaseRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM leases
             WHERE (state = 'live' AND expires_at_ms <= ?1)
                OR (state = 'reclaiming' AND reclaiming_since_ms <= ?2)
             ORDER BY port"
        ))?;
        let rows = stmt.query_map(
            params![now.timestamp_millis(), stale_before.timestamp_millis()],
            record_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Take ownership of `record` for collection, re-checking that it is
    /// still expired (or an abandoned tombstone) and still owned by the same
    /// key. A lease refreshed since it was listed is left alone.
    pub fn mark_reclaiming(
        &self,
        record: &LeaseRecord,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Tombstone>, StoreError> {
        let conn = self.conn()?;
        let token = new_token();
        let rows = conn.execute(
            "UPDATE leases SET state = 'reclaiming', reclaim_token = ?6, reclaiming_since_ms = ?5
             WHERE port = ?1 AND tenant_id = ?2 AND node_id = ?3 AND endpoint = ?4
               AND ((state = 'live' AND expires_at_ms <= ?5)
                 OR (state = 'reclaiming' AND reclaiming_since_ms <= ?7))",
            params![
                record.port,
                record.key.tenant_id,
                record.key.node_id,
                record.key.endpoint,
                now.timestamp_millis(),
                token,
                stale_before.timestamp_millis(),
            ],
        )?;
        Ok((rows > 0).then(|| Tombstone {
            port: record.port,
            token,
        }))
    }

    /// The live lease for `key`, if any.
    pub fn get(&self, key: &LeaseKey) -> Result<Option<LeaseRecord>, StoreError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM leases WHERE tenant_id = ?1 AND node_id = ?2 AND endpoint = ?3 AND state = 'live'"
                ),
                params![key.tenant_id, key.node_id, key.endpoint],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Public keys holding a session on `port`, live or not.
    pub fn sessions(&self, port: u16) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT public_key FROM lease_keys WHERE port = ?1 ORDER BY public_key")?;
        let rows = stmt.query_map(params![port], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Load every row, ordered by port.
    pub fn list(&self) -> Result<Vec<LeaseRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM leases ORDER BY port"))?;
        let rows = stmt.query_map([], record_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn new_token() -> String {
    format!("{:016x}", rand::random::<u64>())
}

fn upsert_session(
    tx: &Transaction<'_>,
    port: u16,
    public_key: &str,
    expires_at: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    tx.execute(
        "INSERT INTO lease_keys (port, public_key, expires_at_ms) VALUES (?1, ?2, ?3)
         ON CONFLICT (port, public_key) DO UPDATE SET expires_at_ms = excluded.expires_at_ms",
        params![port, public_key, expires_at.timestamp_millis()],
    )
}

fn live_port(tx: &Transaction<'_>, key: &LeaseKey) -> rusqlite::Result<Option<u16>> {
    tx.query_row(
        "SELECT port FROM leases WHERE tenant_id = ?1 AND node_id = ?2 AND endpoint = ?3 AND state = 'live'",
        params![key.tenant_id, key.node_id, key.endpoint],
        |row| row.get(0),
    )
    .optional()
}

fn lowest_free(tx: &Transaction<'_>, range: RangeInclusive<u16>) -> rusqlite::Result<Option<u16>> {
    let (start, end) = (u32::from(*range.start()), u32::from(*range.end()));
    let mut stmt = tx.prepare("SELECT port FROM leases WHERE port BETWEEN ?1 AND ?2 ORDER BY port")?;
    let taken = stmt.query_map(params![start, end], |row| row.get::<_, u32>(0))?;

    let mut candidate = start;
    for port in taken {
        let port = port?;
        if port > candidate {
            break;
        }
        candidate = port + 1;
    }
    Ok(u16::try_from(candidate).ok().filter(|_| candidate <= end))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<LeaseRecord> {
    let port: u16 = row.get(0)?;
    let tenant_id: String = row.get(1)?;
    let node_id: String = row.get(2)?;
    let endpoint: String = row.get(3)?;
    let state: String = row.get(4)?;
    let allocated_at_str: String = row.get(5)?;
    let expires_at_ms: i64 = row.get(6)?;
    let reclaiming_since_ms: Option<i64> = row.get(7)?;

    let allocated_at = DateTime::parse_from_rfc3339(&allocated_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let expires_at = DateTime::<Utc>::from_timestamp_millis(expires_at_ms).unwrap_or_default();

    Ok(LeaseRecord {
        port,
        key: LeaseKey {
            tenant_id,
            node_id,
            endpoint,
        },
        state: LeaseState::parse(&state),
        allocated_at,
        expires_at,
        reclaiming_since: reclaiming_since_ms.and_then(DateTime::<Utc>::from_timestamp_millis),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn key(node: &str) -> LeaseKey {
        LeaseKey::new("tenant", node, "")
    }

    fn claim(store: &LeaseStore, node: &str, now: DateTime<Utc>, secs: i64) -> Claim {
        claim_as(store, node, "pk", now, secs)
    }

    fn claim_as(store: &LeaseStore, node: &str, public_key: &str, now: DateTime<Utc>, secs: i64) -> Claim {
        store
            .claim(&key(node), public_key, 30000..=30002, now, now + ChronoDuration::seconds(secs))
            .unwrap()
    }

    fn tombstone(release: Release) -> Tombstone {
        match release {
            Release::Reclaiming(tombstone) => tombstone,
            other => panic!("expected a tombstone, got {other:?}"),
        }
    }

    #[test]
    fn claims_lowest_free_port_and_exhausts() {
        let store = LeaseStore::open_in_memory().unwrap();
        let now = Utc::now();
        assert_eq!(claim(&store, "a", now, 60), Claim::Claimed(30000));
        assert_eq!(claim(&store, "b", now, 60), Claim::Claimed(30001));
        assert_eq!(claim(&store, "c", now, 60), Claim::Claimed(30002));
        assert_eq!(claim(&store, "d", now, 60), Claim::Exhausted);
    }

    #[test]
    fn refresh_keeps_port_and_extends_expiry() {
        let store = LeaseStore::open_in_memory().unwrap();
        let now = Utc::now();
        assert_eq!(claim(&store, "a", now, 60), Claim::Claimed(30000));
        assert_eq!(claim(&store, "a", now, 600), Claim::Refreshed(30000));

        let record = store.get(&key("a")).unwrap().unwrap();
        assert_eq!(record.expires_at.timestamp_millis(), (now + ChronoDuration::seconds(600)).timestamp_millis());
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.sessions(30000).unwrap(), vec!["pk".to_string()]);
    }

    #[test]
    fn released_port_is_held_until_forgotten() {
        let store = LeaseStore::open_in_memory().unwrap();
        let now = Utc::now();
        claim(&store, "a", now, 60);
        claim(&store, "b", now, 60);

        let released = tombstone(store.release(&key("a"), None, now).unwrap());
        assert_eq!(released.port, 30000);
        assert_eq!(store.release(&key("a"), None, now).unwrap(), Release::Missing);
        assert_eq!(claim(&store, "c", now, 60), Claim::Claimed(30002));
        assert_eq!(claim(&store, "d", now, 60), Claim::Exhausted);

        assert!(store.forget(&released).unwrap());
        assert!(!store.forget(&released).unwrap());
        assert_eq!(claim(&store, "d", now, 60), Claim::Claimed(30000));
    }

    #[test]
    fn forget_ignores_live_rows() {
        let store = LeaseStore::open_in_memory().unwrap();
        let now = Utc::now();
        claim(&store, "a", now, 60);
        let guess = Tombstone {
            port: 30000,
            token: "0000000000000000".to_string(),
        };
        assert!(!store.forget(&guess).unwrap());
        assert!(store.get(&key("a")).unwrap().is_some());
    }

    #[test]
    fn released_key_can_claim_a_new_port() {
        let store = LeaseStore::open_in_memory().unwrap();
        let now = Utc::now();
        claim(&store, "a", now, 60);
        store.release(&key("a"), None, now).unwrap();
        assert_eq!(claim(&store, "a", now, 60), Claim::Claimed(30001));
    }

    #[test]
    fn fresh_tombstones_are_not_listed() {
        let store = LeaseStore::open_in_memory().unwrap();
        let now = Utc::now();
        claim(&store, "a", now, 5);
        claim(&store, "b", now, 600);
        claim(&store, "c", now, 600);
        store.release(&key("c"), None, now).unwrap();

        let later = now + ChronoDuration::seconds(6);
        let expired: Vec<u16> = store
            .list_expired(later, later - ChronoDuration::seconds(60))
            .unwrap()
            .iter()
            .map(|r| r.port)
            .collect();
        assert_eq!(expired, vec![30000]);

        // past the grace window the tombstone counts as abandoned
        let expired: Vec<u16> = store
            .list_expired(later, later)
            .unwrap()
            .iter()
            .map(|r| r.port)
            .collect();
        assert_eq!(expired, vec![30000, 30002]);
    }

    #[test]
    fn taken_over_tombstone_cannot_be_forgotten_by_its_first_owner() {
        let store = LeaseStore::open_in_memory().unwrap();
        let now = Utc::now();
        claim(&store, "a", now, 60);
        let first = tombstone(store.release(&key("a"), None, now).unwrap());

        let later = now + ChronoDuration::seconds(120);
        let listed = store.list_expired(later, later).unwrap();
        let second = store.mark_reclaiming(&listed[0], later, later).unwrap().unwrap();
        assert_ne!(first.token, second.token);

        assert!(!store.forget(&first).unwrap());
        assert!(store.forget(&second).unwrap());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn mark_reclaiming_skips_refreshed_lease() {
        let store = LeaseStore::open_in_memory().unwrap();
        let now = Utc::now();
        claim(&store, "a", now, 5);
        let later = now + ChronoDuration::seconds(6);
        let listed = store.list_expired(later, now).unwrap();
        assert_eq!(listed.len(), 1);

        // refreshed between listing and collection
        claim(&store, "a", later, 600);
        assert!(store.mark_reclaiming(&listed[0], later, now).unwrap().is_none());
        assert_eq!(store.get(&key("a")).unwrap().unwrap().state, LeaseState::Live);
    }

    #[test]
    fn lease_lives_while_any_session_does() {
        let store = LeaseStore::open_in_memory().unwrap();
        let now = Utc::now();
        assert_eq!(claim_as(&store, "a", "pk-1", now, 60), Claim::Claimed(30000));
        assert_eq!(claim_as(&store, "a", "pk-2", now, 600), Claim::Refreshed(30000));
        assert_eq!(store.sessions(30000).unwrap().len(), 2);

        // a shorter refresh of one session keeps the lease at the longest
        claim_as(&store, "a", "pk-1", now, 30);
        let record = store.get(&key("a")).unwrap().unwrap();
        assert_eq!(record.expires_at.timestamp_millis(), (now + ChronoDuration::seconds(600)).timestamp_millis());

        assert_eq!(store.release(&key("a"), Some("pk-2"), now).unwrap(), Release::Shared(30000));
        let record = store.get(&key("a")).unwrap().unwrap();
        assert_eq!(record.expires_at.timestamp_millis(), (now + ChronoDuration::seconds(30)).timestamp_millis());

        let last = tombstone(store.release(&key("a"), Some("pk-1"), now).unwrap());
        assert!(store.forget(&last).unwrap());
        assert!(store.sessions(30000).unwrap().is_empty());
    }

    #[test]
    fn expired_sessions_do_not_hold_the_lease() {
        let store = LeaseStore::open_in_memory().unwrap();
        let now = Utc::now();
        claim_as(&store, "a", "pk-1", now, 5);
        claim_as(&store, "a", "pk-2", now, 600);

        let later = now + ChronoDuration::seconds(10);
        let released = store.release(&key("a"), Some("pk-2"), later).unwrap();
        assert_eq!(tombstone(released).port, 30000);
    }

    #[test]
    fn release_without_a_key_ends_every_session() {
        let store = LeaseStore::open_in_memory().unwrap();
        let now = Utc::now();
        claim_as(&store, "a", "pk-1", now, 600);
        claim_as(&store, "a", "pk-2", now, 600);
        let released = tombstone(store.release(&key("a"), None, now).unwrap());
        assert!(store.forget(&released).unwrap());

        // a new lease on the port starts with no inherited sessions
        claim_as(&store, "b", "pk-3", now, 600);
        assert_eq!(store.sessions(30000).unwrap(), vec!["pk-3".to_string()]);
    }

    #[test]
    fn replicas_sharing_a_file_never_double_claim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.db");
        let first = LeaseStore::open(&path).unwrap();
        let second = LeaseStore::open(&path).unwrap();
        let now = Utc::now();

        assert_eq!(claim(&first, "a", now, 60), Claim::Claimed(30000));
        assert_eq!(claim(&second, "b", now, 60), Claim::Claimed(30001));
        assert_eq!(claim(&second, "a", now, 60), Claim::Refreshed(30000));
        assert_eq!(first.list().unwrap().len(), 2);
    }
}
