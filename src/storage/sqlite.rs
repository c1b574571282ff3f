//! SQLite adapter: the relational reference sink.
//!
//! Results land in the `monitors` table, one row per result, one transaction
//! per batch. The schema is applied through migrations embedded at build time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection};

use super::{StorageAdapter, StorageError};
use crate::model::ProbeResult;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const INSERT_SQL: &str = r#"INSERT INTO "monitors" (
    "monitorId", "monitorName", "monitorType", "targetHost", "targetPort", "targetPath",
    "executedAt", "agentId", "agentRegion", "success", "responseTime", "responseSizeBytes",
    "httpMethod", "expectedStatusCode", "responseStatusCode", "responseContentType",
    "responseServer", "responseCacheStatus", "dnsLookupMs", "tcpConnectMs", "tlsHandshakeMs",
    "timeToFirstByteMs", "warningThresholdMs", "criticalThresholdMs", "packetLoss", "jitterMs",
    "dnsQueryType", "dnsExpectedResponse", "dnsResponseValue", "errorMessage", "errorType",
    "rawResponseHeaders", "rawResponseBody", "rawRequestHeaders", "rawNetworkData"
) VALUES (
    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
    ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34, ?35
)"#;

/// Thread-safe SQLite sink. All database work runs on the blocking pool.
pub struct SqliteAdapter {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
    connected: AtomicBool,
}

impl SqliteAdapter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            conn: Arc::new(Mutex::new(None)),
            connected: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the open connection on the blocking pool.
    async fn with_connection<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let conn = guard.as_mut().ok_or(StorageError::NotConnected("sqlite"))?;
            f(conn)
        })
        .await?
    }
}

/// Open the database and bring the schema up to date.
fn open(path: &Path) -> Result<Connection, StorageError> {
    let mut conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    let report = embedded::migrations::runner().run(&mut conn)?;
    for migration in report.applied_migrations() {
        tracing::info!(migration = %migration, "Applied database migration");
    }

    Ok(conn)
}

fn to_json(value: &Option<serde_json::Value>) -> Result<Option<String>, serde_json::Error> {
    value.as_ref().map(serde_json::to_string).transpose()
}

/// Insert a whole batch in one transaction.
fn insert_batch(conn: &mut Connection, results: &[ProbeResult]) -> Result<(), StorageError> {
    let tx = conn.transaction()?;

    {
        let mut stmt = tx.prepare_cached(INSERT_SQL)?;

        for r in results {
            let response_values = r.dns_response_value.as_ref().map(serde_json::to_string).transpose()?;
            stmt.execute(params![
                r.monitor_id,
                r.monitor_name,
                r.monitor_type.as_str(),
                r.target_host,
                r.target_port,
                r.target_path,
                r.executed_at.format(TIME_FORMAT).to_string(),
                r.agent_id,
                r.agent_region,
                r.success(),
                r.response_time,
                r.response_size_bytes,
                r.http_method,
                r.expected_status_code,
                r.response_status_code,
                r.response_content_type,
                r.response_server,
                r.response_cache_status,
                r.dns_lookup_ms,
                r.tcp_connect_ms,
                r.tls_handshake_ms,
                r.time_to_first_byte_ms,
                r.warning_threshold_ms,
                r.critical_threshold_ms,
                r.packet_loss,
                r.jitter_ms,
                r.dns_query_type,
                r.dns_expected_response,
                response_values,
                r.error_message(),
                r.error_type().map(|t| t.as_str()),
                to_json(&r.raw_response_headers)?,
                r.raw_response_body,
                to_json(&r.raw_request_headers)?,
                to_json(&r.raw_network_data)?,
            ])?;
        }
    }

    // Dropping `tx` on any error above rolls the batch back.
    tx.commit()?;
    Ok(())
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn connect(&self) -> Result<(), StorageError> {
        let path = self.path.clone();
        let conn = tokio::task::spawn_blocking(move || open(&path)).await??;

        *self.conn.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn);
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(path = %self.path.display(), "SQLite adapter connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.connected.store(false, Ordering::SeqCst);
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| StorageError::Sqlite(e))?;
        }
        Ok(())
    }

    async fn store(&self, results: Arc<[ProbeResult]>) -> Result<(), StorageError> {
        if results.is_empty() {
            return Ok(());
        }
        self.with_connection(move |conn| insert_batch(conn, &results)).await
    }

    fn health_check(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn is_healthy(&self) -> bool {
        let probe = self
            .with_connection(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
            .await;
        match probe {
            Ok(1) => true,
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(error = %e, "SQLite health check failed");
                false
            }
        }
    }
}
