//! StateStore: redb-backed persistence for pipeline runs and leases.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use rollgate_core::{EnvironmentName, PipelineRun, now_ms};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const LEASED_ENVIRONMENTS: [EnvironmentName; 2] =
    [EnvironmentName::Staging, EnvironmentName::Production];

/// Marks an environment as owned by an in-flight run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub family: String,
    pub environment: EnvironmentName,
    pub holder: String,
    pub acquired_at_ms: u64,
}

impl Lease {
    pub fn table_key(&self) -> String {
        lease_key(&self.family, self.environment)
    }
}

fn lease_key(family: &str, environment: EnvironmentName) -> String {
    format!("{family}/{environment}")
}

/// Thread-safe store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(RUNS).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Runs ───────────────────────────────────────────────────────

    /// Store a finished run. Runs are write-once; storing the same run
    /// again replaces it with identical content.
    pub fn put_run(&self, run: &PipelineRun) -> StateResult<()> {
        let key = run.table_key();
        let value = serde_json::to_vec(run).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RUNS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, outcome = %run.outcome(), "run stored");
        Ok(())
    }

    /// Find a run by id, across all families.
    pub fn get_run(&self, id: &str) -> StateResult<Option<PipelineRun>> {
        let suffix = format!(":{id}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNS).map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().ends_with(&suffix) {
                let run: PipelineRun =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                return Ok(Some(run));
            }
        }
        Ok(None)
    }

    /// Runs for a family, newest first.
    pub fn list_runs(&self, family: &str, limit: usize) -> StateResult<Vec<PipelineRun>> {
        // ';' sorts right after ':', bounding the family's key range.
        let start = format!("{family}:");
        let end = format!("{family};");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
            .rev()
            .take(limit)
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let run: PipelineRun =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(run);
        }
        Ok(results)
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Lease every environment of `family` to `holder` in one transaction.
    ///
    /// Fails with `LeaseHeld` and changes nothing if any environment is
    /// already leased, even to the same holder.
    pub fn acquire_lease(&self, family: &str, holder: &str) -> StateResult<Vec<Lease>> {
        let acquired_at_ms = now_ms();
        let leases: Vec<Lease> = LEASED_ENVIRONMENTS
            .iter()
            .map(|&environment| Lease {
                family: family.to_string(),
                environment,
                holder: holder.to_string(),
                acquired_at_ms,
            })
            .collect();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            for lease in &leases {
                let key = lease.table_key();
                if let Some(existing) = table.get(key.as_str()).map_err(map_err!(Read))? {
                    let held: Lease = serde_json::from_slice(existing.value())
                        .map_err(map_err!(Deserialize))?;
                    return Err(StateError::LeaseHeld {
                        key,
                        holder: held.holder,
                    });
                }
            }
            for lease in &leases {
                let value = serde_json::to_vec(lease).map_err(map_err!(Serialize))?;
                table
                    .insert(lease.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(%family, %holder, "leases acquired");
        Ok(leases)
    }

    /// Release the leases `holder` has on `family`. Leases held by anyone
    /// else are left alone. Returns how many were released.
    pub fn release_lease(&self, family: &str, holder: &str) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut released = 0;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            for environment in LEASED_ENVIRONMENTS {
                let key = lease_key(family, environment);
                let owned = match table.get(key.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => {
                        let lease: Lease = serde_json::from_slice(guard.value())
                            .map_err(map_err!(Deserialize))?;
                        lease.holder == holder
                    }
                    None => false,
                };
                if owned {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                    released += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%family, %holder, released, "leases released");
        Ok(released)
    }

    pub fn get_lease(&self, family: &str, environment: EnvironmentName) -> StateResult<Option<Lease>> {
        let key = lease_key(family, environment);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LEASES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let lease: Lease =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(lease))
            }
            None => Ok(None),
        }
    }
}
