use crate::{open_connection, open_in_memory_connection, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use sidx_core::{SerializedState, StateId, StateStore, StateStoreError, StatesById};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Primary state table backed by the same SQLite file as the reindex queue.
///
/// Reads through the `StateStore` trait run on the blocking pool.
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            conn: Arc::new(Mutex::new(open_connection(path)?)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Ok(Self {
            conn: Arc::new(Mutex::new(open_in_memory_connection()?)),
        })
    }

    /// Upserts reported values, bumping the version of existing IDs, and
    /// returns the states as stored.
    pub fn report_states(
        &self,
        network_id: &str,
        reporter_id: &str,
        values: &BTreeMap<StateId, Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<StatesById, StorageError> {
        let time_ms = u64::try_from(now.timestamp_millis()).unwrap_or_default();
        let mut conn = lock(&self.conn);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut stored = StatesById::new();
        {
            let mut upsert = tx.prepare(
                "
                INSERT INTO states (network_id, state_type, device_id, value, version, reporter_id, time_ms)
                VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)
                ON CONFLICT(network_id, state_type, device_id) DO UPDATE SET
                    value=excluded.value,
                    version=states.version + 1,
                    reporter_id=excluded.reporter_id,
                    time_ms=excluded.time_ms
                RETURNING version
                ",
            )?;
            for (id, value) in values {
                let version: i64 = upsert.query_row(
                    params![
                        network_id,
                        id.state_type,
                        id.device_id,
                        value,
                        reporter_id,
                        time_ms as i64,
                    ],
                    |row| row.get(0),
                )?;
                stored.insert(
                    id.clone(),
                    SerializedState {
                        value: value.clone(),
                        version: u64::try_from(version).unwrap_or_default(),
                        reporter_id: reporter_id.to_string(),
                        time_ms,
                    },
                );
            }
        }
        tx.commit()?;

        debug!(
            event = "states_reported",
            network_id = %network_id,
            count = stored.len()
        );
        Ok(stored)
    }
}

fn load_states(
    conn: &Mutex<Connection>,
    network_id: &str,
    ids: &[StateId],
) -> Result<StatesById, StorageError> {
    let conn = lock(conn);
    let mut select = conn.prepare_cached(
        "
        SELECT value, version, reporter_id, time_ms
        FROM states
        WHERE network_id = ?1 AND state_type = ?2 AND device_id = ?3
        ",
    )?;

    let mut states = StatesById::new();
    for id in ids {
        let row = select
            .query_row(params![network_id, id.state_type, id.device_id], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .optional()?;
        if let Some((value, version, reporter_id, time_ms)) = row {
            states.insert(
                id.clone(),
                SerializedState {
                    value,
                    version: u64::try_from(version).unwrap_or_default(),
                    reporter_id,
                    time_ms: u64::try_from(time_ms).unwrap_or_default(),
                },
            );
        }
    }
    Ok(states)
}

fn load_all_ids(
    conn: &Mutex<Connection>,
) -> Result<BTreeMap<String, Vec<StateId>>, StorageError> {
    let conn = lock(conn);
    let mut select = conn.prepare(
        "
        SELECT network_id, state_type, device_id
        FROM states
        ORDER BY network_id, state_type, device_id
        ",
    )?;
    let rows = select.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut ids: BTreeMap<String, Vec<StateId>> = BTreeMap::new();
    for row in rows {
        let (network_id, state_type, device_id) = row?;
        ids.entry(network_id)
            .or_default()
            .push(StateId::new(state_type, device_id));
    }
    Ok(ids)
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl From<StorageError> for StateStoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(code, _))
                if code.code == rusqlite::ErrorCode::DatabaseBusy
                    || code.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                StateStoreError::Unavailable(err.to_string())
            }
            other => StateStoreError::Backend(other.to_string()),
        }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get_states(
        &self,
        network_id: &str,
        ids: &[StateId],
    ) -> Result<StatesById, StateStoreError> {
        let conn = self.conn.clone();
        let network_id = network_id.to_string();
        let ids = ids.to_vec();
        tokio::task::spawn_blocking(move || load_states(&conn, &network_id, &ids))
            .await
            .map_err(|err| StateStoreError::Backend(format!("state read task failed: {err}")))?
            .map_err(StateStoreError::from)
    }

    async fn get_all_ids(&self) -> Result<BTreeMap<String, Vec<StateId>>, StateStoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || load_all_ids(&conn))
            .await
            .map_err(|err| StateStoreError::Backend(format!("state read task failed: {err}")))?
            .map_err(StateStoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, secs)
            .single()
            .expect("valid timestamp")
    }

    fn values(entries: &[(&str, &str, &str)]) -> BTreeMap<StateId, Vec<u8>> {
        entries
            .iter()
            .map(|(state_type, device_id, value)| {
                (
                    StateId::new(*state_type, *device_id),
                    value.as_bytes().to_vec(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn report_then_read_back_with_bumped_versions() {
        let store = SqliteStateStore::open_in_memory().expect("store");
        let first = store
            .report_states("nw-1", "gw-1", &values(&[("foo", "dev-1", "a")]), at(0))
            .expect("report");
        assert_eq!(first[&StateId::new("foo", "dev-1")].version, 1);

        let second = store
            .report_states("nw-1", "gw-2", &values(&[("foo", "dev-1", "b")]), at(5))
            .expect("report again");
        let state = &second[&StateId::new("foo", "dev-1")];
        assert_eq!(state.version, 2);
        assert_eq!(state.reporter_id, "gw-2");

        let loaded = store
            .get_states(
                "nw-1",
                &[StateId::new("foo", "dev-1"), StateId::new("foo", "missing")],
            )
            .await
            .expect("get");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[&StateId::new("foo", "dev-1")], *state);
    }

    #[tokio::test]
    async fn networks_are_isolated() {
        let store = SqliteStateStore::open_in_memory().expect("store");
        store
            .report_states("nw-1", "gw-1", &values(&[("foo", "dev-1", "a")]), at(0))
            .expect("report");

        let other = store
            .get_states("nw-2", &[StateId::new("foo", "dev-1")])
            .await
            .expect("get");
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn all_ids_are_grouped_by_network_in_order() {
        let store = SqliteStateStore::open_in_memory().expect("store");
        store
            .report_states(
                "nw-b",
                "gw-1",
                &values(&[("foo", "dev-2", "x"), ("bar", "dev-1", "y")]),
                at(0),
            )
            .expect("report");
        store
            .report_states("nw-a", "gw-2", &values(&[("foo", "dev-9", "z")]), at(1))
            .expect("report");

        let ids = store.get_all_ids().await.expect("ids");
        assert_eq!(
            ids,
            BTreeMap::from([
                ("nw-a".to_string(), vec![StateId::new("foo", "dev-9")]),
                (
                    "nw-b".to_string(),
                    vec![StateId::new("bar", "dev-1"), StateId::new("foo", "dev-2")]
                ),
            ])
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reads_wait_on_the_blocking_pool_while_the_connection_is_held() {
        let store = Arc::new(SqliteStateStore::open_in_memory().expect("store"));
        store
            .report_states("nw-1", "gw-1", &values(&[("foo", "dev-1", "a")]), at(0))
            .expect("report");

        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let conn = store.conn.clone();
        let holder = std::thread::spawn(move || {
            let _guard = lock(&conn);
            held_tx.send(()).expect("held");
            let _ = release_rx.recv();
        });
        held_rx.recv().expect("connection held");

        let read = tokio::spawn({
            let store = store.clone();
            async move { store.get_all_ids().await }
        });
        // The runtime thread keeps making progress while the read waits.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!read.is_finished());

        release_tx.send(()).expect("release");
        holder.join().expect("holder thread");
        let ids = read.await.expect("read task").expect("ids");
        assert_eq!(ids["nw-1"], vec![StateId::new("foo", "dev-1")]);
    }
}
