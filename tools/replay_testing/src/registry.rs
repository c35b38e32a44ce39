use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::errors::ReplayError;
use crate::lifecycle::{ParamStatus, Stage};
use crate::logging::append_run_log;

pub const REGISTRY_FILE_NAME: &str = "registry.sqlite";
const READ_POOL_SIZE: usize = 2;

const MIGRATIONS: [(i64, &str); 1] = [(
    1,
    "CREATE TABLE runs (
        run_id TEXT PRIMARY KEY,
        test_name TEXT NOT NULL,
        test_file TEXT,
        run_dir TEXT NOT NULL,
        stage TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE TABLE run_params (
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        fixture_key TEXT NOT NULL,
        param_name TEXT NOT NULL,
        status TEXT NOT NULL,
        output_path TEXT,
        failure TEXT,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (run_id, fixture_key, param_name)
    );",
)];

type RegistryResult<T> = Result<T, ReplayError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
    pub run_id: String,
    pub test_name: String,
    pub test_file: Option<PathBuf>,
    pub run_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamRecord {
    pub fixture_key: String,
    pub param_name: String,
    pub status: ParamStatus,
    pub output_path: Option<PathBuf>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub run_id: String,
    pub test_name: String,
    pub test_file: Option<PathBuf>,
    pub run_dir: PathBuf,
    pub stage: Stage,
    pub created_at: i64,
    pub params: Vec<ParamRecord>,
}

enum WriteCmd {
    CreateRun {
        run: NewRun,
        now: i64,
        reply: oneshot::Sender<RegistryResult<()>>,
    },
    SetStage {
        run_id: String,
        stage: Stage,
        now: i64,
        reply: oneshot::Sender<RegistryResult<bool>>,
    },
    RecordParam {
        run_id: String,
        param: ParamRecord,
        now: i64,
        reply: oneshot::Sender<RegistryResult<()>>,
    },
}

/// Durable map from run id to artifact directory and per-param outcomes. Writes go
/// through a single writer thread; reads use a small pool of read-only connections.
pub struct RunRegistry {
    write_tx: Option<mpsc::Sender<WriteCmd>>,
    read_pool: ReadPool,
    writer_join: Option<thread::JoinHandle<()>>,
}

impl Drop for RunRegistry {
    fn drop(&mut self) {
        drop(self.write_tx.take());
        if let Some(handle) = self.writer_join.take() {
            let _ = handle.join();
        }
    }
}

impl RunRegistry {
    fn sender(&self) -> RegistryResult<&mpsc::Sender<WriteCmd>> {
        self.write_tx
            .as_ref()
            .ok_or_else(|| ReplayError::Database("registry is closed".to_string()))
    }

    pub fn open_in(tmp_root: &Path) -> RegistryResult<Self> {
        Self::open(tmp_root.join(REGISTRY_FILE_NAME))
    }

    pub fn open(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ReplayError::Database(e.to_string()))?;
        }

        let existed_before_open = path.exists();
        if existed_before_open {
            let meta =
                std::fs::metadata(&path).map_err(|e| ReplayError::Database(e.to_string()))?;
            if meta.len() == 0 {
                return Err(ReplayError::Database(format!(
                    "run registry is 0 bytes (corrupt): {}",
                    path.display()
                )));
            }
        }

        let mut write_conn = Connection::open(&path).map_err(db_err)?;
        configure_write_connection(&write_conn)?;
        if existed_before_open {
            let integrity: String = write_conn
                .pragma_query_value(None, "quick_check", |row| row.get(0))
                .map_err(db_err)?;
            if integrity != "ok" {
                return Err(ReplayError::Database(format!(
                    "run registry failed integrity check: {integrity}"
                )));
            }
        }
        run_migrations(&mut write_conn)?;

        let (write_tx, mut write_rx) = mpsc::channel(64);
        let writer_join = thread::spawn(move || {
            while let Some(cmd) = write_rx.blocking_recv() {
                match cmd {
                    WriteCmd::CreateRun { run, now, reply } => {
                        let _ = reply.send(insert_run(&write_conn, &run, now));
                    }
                    WriteCmd::SetStage {
                        run_id,
                        stage,
                        now,
                        reply,
                    } => {
                        let _ = reply.send(update_stage(&write_conn, &run_id, stage, now));
                    }
                    WriteCmd::RecordParam {
                        run_id,
                        param,
                        now,
                        reply,
                    } => {
                        let _ = reply.send(upsert_param(&write_conn, &run_id, &param, now));
                    }
                }
            }
        });

        let read_pool = ReadPool::open(&path, READ_POOL_SIZE)?;
        append_run_log(
            "info",
            "registry.opened",
            json!({ "path": path.display().to_string() }),
        );
        Ok(Self {
            write_tx: Some(write_tx),
            read_pool,
            writer_join: Some(writer_join),
        })
    }

    fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<RegistryResult<T>>) -> WriteCmd,
    ) -> RegistryResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender()?
            .blocking_send(build(reply_tx))
            .map_err(|e| ReplayError::Database(e.to_string()))?;
        reply_rx
            .blocking_recv()
            .map_err(|e| ReplayError::Database(e.to_string()))?
    }

    pub fn create_run(&self, run: NewRun) -> RegistryResult<()> {
        append_run_log(
            "info",
            "registry.run.created",
            json!({
                "run_id": run.run_id,
                "test_name": run.test_name,
                "run_dir": run.run_dir.display().to_string(),
            }),
        );
        let now = unix_millis();
        self.send(|reply| WriteCmd::CreateRun { run, now, reply })
    }

    pub fn set_stage(&self, run_id: &str, stage: Stage) -> RegistryResult<()> {
        let run_id = run_id.to_string();
        let now = unix_millis();
        let updated = self.send(|reply| WriteCmd::SetStage {
            run_id: run_id.clone(),
            stage,
            now,
            reply,
        })?;
        if !updated {
            return Err(ReplayError::RunNotFound(run_id));
        }
        append_run_log(
            "debug",
            "registry.run.stage",
            json!({"run_id": run_id, "stage": stage.as_str()}),
        );
        Ok(())
    }

    pub fn record_param(&self, run_id: &str, param: ParamRecord) -> RegistryResult<()> {
        append_run_log(
            "debug",
            "registry.param.recorded",
            json!({
                "run_id": run_id,
                "fixture": param.fixture_key,
                "param": param.param_name,
                "status": param.status.as_str(),
            }),
        );
        let run_id = run_id.to_string();
        let now = unix_millis();
        self.send(|reply| WriteCmd::RecordParam {
            run_id,
            param,
            now,
            reply,
        })
    }

    /// Fails with `RunNotFound` when the id is unknown or its artifact directory is gone.
    pub fn lookup(&self, run_id: &str) -> RegistryResult<RunRecord> {
        let record = self
            .read_pool
            .with_conn(|conn| fetch_run(conn, run_id))?
            .ok_or_else(|| ReplayError::RunNotFound(format!("no run with id `{run_id}`")))?;
        if !record.run_dir.is_dir() {
            append_run_log(
                "warn",
                "registry.run.dir_missing",
                json!({"run_id": run_id, "run_dir": record.run_dir.display().to_string()}),
            );
            return Err(ReplayError::RunNotFound(format!(
                "artifacts for run `{run_id}` are gone from {}",
                record.run_dir.display()
            )));
        }
        Ok(record)
    }
}

#[derive(Clone)]
struct ReadPool {
    conns: Arc<Vec<Mutex<Connection>>>,
    next: Arc<AtomicUsize>,
}

impl ReadPool {
    fn open(path: &Path, size: usize) -> RegistryResult<Self> {
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(db_err)?;
            conn.busy_timeout(std::time::Duration::from_secs(3))
                .map_err(db_err)?;
            conns.push(Mutex::new(conn));
        }
        Ok(Self {
            conns: Arc::new(conns),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> RegistryResult<T>) -> RegistryResult<T> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        let guard = self.conns[idx]
            .lock()
            .map_err(|_| ReplayError::Database("read connection lock poisoned".to_string()))?;
        f(&guard)
    }
}

fn configure_write_connection(conn: &Connection) -> RegistryResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(db_err)?;
    Ok(())
}

fn run_migrations(conn: &mut Connection) -> RegistryResult<()> {
    conn.execute_batch("BEGIN IMMEDIATE; CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL); COMMIT;")
        .map_err(db_err)?;

    for (version, sql) in MIGRATIONS {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();
        if exists {
            continue;
        }

        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, unix_millis()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        append_run_log(
            "info",
            "registry.migration.applied",
            json!({ "version": version }),
        );
    }
    Ok(())
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn insert_run(conn: &Connection, run: &NewRun, now: i64) -> RegistryResult<()> {
    conn.execute(
        "INSERT INTO runs(run_id, test_name, test_file, run_dir, stage, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            run.run_id,
            run.test_name,
            run.test_file.as_deref().map(path_text),
            path_text(&run.run_dir),
            Stage::Pending.as_str(),
            now,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn update_stage(conn: &Connection, run_id: &str, stage: Stage, now: i64) -> RegistryResult<bool> {
    let changed = conn
        .execute(
            "UPDATE runs SET stage = ?2, updated_at = ?3 WHERE run_id = ?1",
            params![run_id, stage.as_str(), now],
        )
        .map_err(db_err)?;
    Ok(changed == 1)
}

fn upsert_param(conn: &Connection, run_id: &str, param: &ParamRecord, now: i64) -> RegistryResult<()> {
    conn.execute(
        "INSERT INTO run_params(run_id, fixture_key, param_name, status, output_path, failure, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(run_id, fixture_key, param_name) DO UPDATE SET
            status = excluded.status,
            output_path = excluded.output_path,
            failure = excluded.failure,
            updated_at = excluded.updated_at",
        params![
            run_id,
            param.fixture_key,
            param.param_name,
            param.status.as_str(),
            param.output_path.as_deref().map(path_text),
            param.failure,
            now,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn fetch_run(conn: &Connection, run_id: &str) -> RegistryResult<Option<RunRecord>> {
    let row = conn
        .query_row(
            "SELECT run_id, test_name, test_file, run_dir, stage, created_at FROM runs WHERE run_id = ?1",
            [run_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?;
    let Some((run_id, test_name, test_file, run_dir, stage, created_at)) = row else {
        return Ok(None);
    };
    let stage = Stage::parse(&stage)
        .ok_or_else(|| ReplayError::Database(format!("unknown stage `{stage}`")))?;

    let mut stmt = conn
        .prepare(
            "SELECT fixture_key, param_name, status, output_path, failure FROM run_params
             WHERE run_id = ?1 ORDER BY rowid",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([&run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })
        .map_err(db_err)?;
    let mut params = Vec::new();
    for row in rows {
        let (fixture_key, param_name, status, output_path, failure) = row.map_err(db_err)?;
        let status = ParamStatus::parse(&status)
            .ok_or_else(|| ReplayError::Database(format!("unknown param status `{status}`")))?;
        params.push(ParamRecord {
            fixture_key,
            param_name,
            status,
            output_path: output_path.map(PathBuf::from),
            failure,
        });
    }

    Ok(Some(RunRecord {
        run_id,
        test_name,
        test_file: test_file.map(PathBuf::from),
        run_dir: PathBuf::from(run_dir),
        stage,
        created_at,
        params,
    }))
}

fn db_err(error: rusqlite::Error) -> ReplayError {
    ReplayError::Database(error.to_string())
}

pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
