//! Persistence for the control plane.
//!
//! A single SQLite database holds functions, executions and VMs; writes to a
//! given row go through one connection pool and SQLite's own serialisation.
//! Terminal execution transitions use a conditional `UPDATE` so that racing
//! finalisers (result reconciler vs. timeout monitor) resolve to exactly one
//! winner. An optional Redis cache fronts function-metadata reads; its
//! absence degrades to direct reads.

mod cache;

use std::path::Path;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::warn;

use cirrus_common::{Error, ExecutionStatus, Result, VmStatus};

use crate::cache::MetadataCache;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Function row. The API never serialises this directly (the registry maps
/// it to `FunctionMetadata`), so carrying `code` through the cache is fine.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize, serde::Deserialize)]
pub struct FunctionRecord {
    pub id: String,
    pub name: String,
    pub runtime: String,
    pub memory: i64,
    pub timeout: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: String,
    pub version: String,
    pub code: String,
}

/// Execution row. One per invocation attempt.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize, serde::Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub function_id: String,
    pub vm_id: Option<String>,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Micro-VM row.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize, serde::Deserialize)]
pub struct VmRecord {
    pub id: String,
    pub status: String,
    pub ip: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub memory: i64,
    pub cpu: i64,
    pub is_warm: bool,
}

/// Entry in the in-memory active-execution index.
#[derive(Debug, Clone)]
pub struct ActiveExecution {
    pub vm_id: String,
    pub started_at: DateTime<Utc>,
}

/// Durable store plus the in-memory active-execution index.
///
/// Cheap to clone; all clones share the pool and the index.
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
    cache: Option<MetadataCache>,
    active: std::sync::Arc<DashMap<String, ActiveExecution>>,
}

impl StateStore {
    /// Open (creating if needed) the database at `path`, run migrations, and
    /// optionally attach a Redis metadata cache. A cache that cannot be
    /// reached is dropped with a warning, never an error.
    pub async fn connect(path: impl AsRef<Path>, redis_url: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(Error::storage)?;

        MIGRATOR.run(&pool).await.map_err(Error::storage)?;

        let cache = match redis_url {
            Some(url) => match MetadataCache::connect(url).await {
                Ok(cache) => Some(cache),
                Err(err) => {
                    warn!(error = %err, "Redis not available, continuing without cache");
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            pool,
            cache,
            active: std::sync::Arc::new(DashMap::new()),
        })
    }

    /// In-memory database for tests. Single connection, no cache.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(Error::storage)?;
        MIGRATOR.run(&pool).await.map_err(Error::storage)?;
        Ok(Self {
            pool,
            cache: None,
            active: std::sync::Arc::new(DashMap::new()),
        })
    }

    // --- Functions ---

    /// Insert or replace a function row. A name collision on insert surfaces
    /// as `FunctionAlreadyExists`.
    pub async fn save_function(&self, function: &FunctionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO functions
                (id, name, runtime, memory, timeout, created_at, updated_at, status, version, code)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                runtime = excluded.runtime,
                memory = excluded.memory,
                timeout = excluded.timeout,
                updated_at = excluded.updated_at,
                status = excluded.status,
                version = excluded.version,
                code = excluded.code
            "#,
        )
        .bind(&function.id)
        .bind(&function.name)
        .bind(&function.runtime)
        .bind(function.memory)
        .bind(function.timeout)
        .bind(function.created_at)
        .bind(function.updated_at)
        .bind(&function.status)
        .bind(&function.version)
        .bind(&function.code)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::FunctionAlreadyExists(function.name.clone())
            }
            _ => Error::storage(e),
        })?;

        if let Some(cache) = &self.cache {
            cache.put_function(function).await;
        }
        Ok(())
    }

    pub async fn get_function(&self, id: &str) -> Result<Option<FunctionRecord>> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get_function(id).await {
                return Ok(Some(hit));
            }
        }

        let record = sqlx::query_as::<_, FunctionRecord>(
            "SELECT id, name, runtime, memory, timeout, created_at, updated_at, status, version, code \
             FROM functions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::storage)?;

        if let (Some(cache), Some(record)) = (&self.cache, &record) {
            cache.put_function(record).await;
        }
        Ok(record)
    }

    pub async fn get_function_by_name(&self, name: &str) -> Result<Option<FunctionRecord>> {
        sqlx::query_as::<_, FunctionRecord>(
            "SELECT id, name, runtime, memory, timeout, created_at, updated_at, status, version, code \
             FROM functions WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::storage)
    }

    pub async fn list_functions(&self) -> Result<Vec<FunctionRecord>> {
        sqlx::query_as::<_, FunctionRecord>(
            "SELECT id, name, runtime, memory, timeout, created_at, updated_at, status, version, code \
             FROM functions ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::storage)
    }

    /// Tombstone a function. The row stays for audit; the registry removes
    /// the code blobs separately.
    pub async fn mark_function_deleted(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE functions SET status = 'deleted', updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::storage)?;

        if let Some(cache) = &self.cache {
            cache.evict_function(id).await;
        }
        Ok(())
    }

    // --- Executions ---

    pub async fn insert_execution(&self, execution: &ExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executions
                (id, function_id, vm_id, status, start_time, end_time, duration_ms, output, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.function_id)
        .bind(&execution.vm_id)
        .bind(&execution.status)
        .bind(execution.start_time)
        .bind(execution.end_time)
        .bind(execution.duration_ms)
        .bind(&execution.output)
        .bind(&execution.error)
        .execute(&self.pool)
        .await
        .map_err(Error::storage)?;
        Ok(())
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        sqlx::query_as::<_, ExecutionRecord>(
            "SELECT id, function_id, vm_id, status, start_time, end_time, duration_ms, output, error \
             FROM executions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::storage)
    }

    pub async fn list_executions_for_function(
        &self,
        function_id: &str,
    ) -> Result<Vec<ExecutionRecord>> {
        sqlx::query_as::<_, ExecutionRecord>(
            "SELECT id, function_id, vm_id, status, start_time, end_time, duration_ms, output, error \
             FROM executions WHERE function_id = ? ORDER BY start_time",
        )
        .bind(function_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::storage)
    }

    /// Record VM assignment and the `pending → running` transition.
    pub async fn mark_execution_running(&self, id: &str, vm_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE executions SET status = 'running', vm_id = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(vm_id)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::storage)?;
        Ok(())
    }

    /// Write a terminal state, but only if the execution is still live.
    ///
    /// End time is now; duration is measured against the row's start time.
    /// Returns whether this call performed the transition: a `false` means
    /// someone else finalised first and the caller's report is a no-op.
    pub async fn finalize_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());

        let Some(current) = self.get_execution(id).await? else {
            return Err(Error::ExecutionNotFound(id.to_string()));
        };
        let end_time = Utc::now();
        let duration_ms = (end_time - current.start_time).num_milliseconds();

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?, end_time = ?, duration_ms = ?, output = ?, error = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(status.as_str())
        .bind(end_time)
        .bind(duration_ms)
        .bind(output)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::storage)?;

        Ok(result.rows_affected() > 0)
    }

    // --- VMs ---

    pub async fn save_vm(&self, vm: &VmRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vms (id, status, ip, created_at, last_used, memory, cpu, is_warm)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                ip = excluded.ip,
                last_used = excluded.last_used,
                memory = excluded.memory,
                cpu = excluded.cpu,
                is_warm = excluded.is_warm
            "#,
        )
        .bind(&vm.id)
        .bind(&vm.status)
        .bind(&vm.ip)
        .bind(vm.created_at)
        .bind(vm.last_used)
        .bind(vm.memory)
        .bind(vm.cpu)
        .bind(vm.is_warm)
        .execute(&self.pool)
        .await
        .map_err(Error::storage)?;
        Ok(())
    }

    pub async fn update_vm_status(&self, id: &str, status: VmStatus) -> Result<()> {
        sqlx::query("UPDATE vms SET status = ?, last_used = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::storage)?;
        Ok(())
    }

    pub async fn get_vm(&self, id: &str) -> Result<Option<VmRecord>> {
        sqlx::query_as::<_, VmRecord>(
            "SELECT id, status, ip, created_at, last_used, memory, cpu, is_warm FROM vms WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::storage)
    }

    pub async fn list_vms(&self) -> Result<Vec<VmRecord>> {
        sqlx::query_as::<_, VmRecord>(
            "SELECT id, status, ip, created_at, last_used, memory, cpu, is_warm FROM vms ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::storage)
    }

    pub async fn delete_vm(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM vms WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::storage)?;
        Ok(())
    }

    // --- Active-execution index ---

    pub fn track_execution(&self, execution_id: &str, vm_id: &str) {
        self.active.insert(
            execution_id.to_string(),
            ActiveExecution {
                vm_id: vm_id.to_string(),
                started_at: Utc::now(),
            },
        );
    }

    pub fn untrack_execution(&self, execution_id: &str) {
        self.active.remove(execution_id);
    }

    pub fn is_execution_active(&self, execution_id: &str) -> bool {
        self.active.contains_key(execution_id)
    }

    /// Snapshot of the index, for the timeout monitor's scan.
    pub fn active_executions(&self) -> Vec<(String, ActiveExecution)> {
        self.active
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
