use std::{collections::HashSet, str::FromStr, time::Duration};

use chrono::NaiveDate;
use sqlx::{
    query::Query,
    sqlite::{Sqlite, SqliteArguments, SqliteConnectOptions},
    ConnectOptions, Connection, Row, SqliteConnection,
};
use tracing::{debug, error, info, warn};

use crate::{
    models::{CompletedResult, ScanFingerprint, ScanRecord, ScanStatus},
    security::{is_valid_column_spec, InvalidIdentifier, SqlIdent},
};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    InvalidIdentifier(#[from] InvalidIdentifier),
    #[error("column `{column}` has an invalid type or constraint `{spec}`")]
    InvalidColumnSpec { column: String, spec: String },
    #[error("table schema is missing required columns: {0:?}")]
    IncompleteSchema(Vec<String>),
    #[error("failed to create table {table}: {source}")]
    CreateTable {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub fn daily_table_name(date: NaiveDate) -> String {
    format!("msf_console_{}", date.format("%Y_%m_%d"))
}

const REQUIRED_COLUMNS: [&str; 11] = [
    "id",
    "status",
    "host",
    "module",
    "rport",
    "ports",
    "threads",
    "duration",
    "output",
    "compressed_output",
    "claimed_at",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    fields: Vec<(String, Vec<String>)>,
}

impl TableSchema {
    /// Column names are lowercased and validated, as are their type and
    /// constraint tokens. Every default column must be present since the
    /// cache queries them by name.
    pub fn new(fields: Vec<(String, Vec<String>)>) -> Result<Self, CacheError> {
        let mut normalized = Vec::with_capacity(fields.len());
        for (name, tokens) in fields {
            let name = SqlIdent::parse(&name.to_lowercase())?.as_str().to_string();
            if let Some(spec) = tokens.iter().find(|t| !is_valid_column_spec(t)) {
                return Err(CacheError::InvalidColumnSpec {
                    column: name,
                    spec: spec.clone(),
                });
            }
            normalized.push((name, tokens));
        }
        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|required| !normalized.iter().any(|(name, _)| name == *required))
            .map(|s| s.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(CacheError::IncompleteSchema(missing));
        }
        Ok(Self { fields: normalized })
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    fn create_statement(&self, table: &SqlIdent) -> String {
        let columns: Vec<String> = self
            .fields
            .iter()
            .map(|(name, tokens)| format!("{} {}", name, tokens.join(" ").to_uppercase()))
            .collect();
        format!("CREATE TABLE IF NOT EXISTS {} ({})", table, columns.join(", "))
    }
}

impl Default for TableSchema {
    fn default() -> Self {
        let field = |name: &str, tokens: &[&str]| {
            (
                name.to_string(),
                tokens.iter().map(|t| t.to_string()).collect(),
            )
        };
        Self {
            fields: vec![
                field("id", &["INTEGER", "PRIMARY KEY", "AUTOINCREMENT"]),
                field("status", &["TEXT", "NOT NULL"]),
                field("host", &["TEXT", "NOT NULL"]),
                field("module", &["TEXT", "NOT NULL"]),
                field("rport", &["INTEGER"]),
                field("ports", &["TEXT"]),
                field("threads", &["INTEGER"]),
                field("duration", &["REAL"]),
                field("output", &["TEXT"]),
                field("compressed_output", &["TEXT"]),
                field("claimed_at", &["INTEGER"]),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_all<'q>(mut query: SqliteQuery<'q>, values: &[SqlValue]) -> SqliteQuery<'q> {
    for value in values {
        query = match value {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
        };
    }
    query
}

/// `rport`/`ports` match when equal or when either side is NULL.
const FINGERPRINT_MATCH: &str = "module = ? AND host = ? \
     AND (? IS NULL OR rport IS NULL OR rport = ?) \
     AND (? IS NULL OR ports IS NULL OR ports = ?) \
     AND threads = ?";

fn fingerprint_params(fp: &ScanFingerprint) -> Vec<SqlValue> {
    let rport = SqlValue::from(fp.rport.map(i64::from));
    let ports = SqlValue::from(fp.ports.clone());
    vec![
        fp.module.as_str().into(),
        fp.rhosts.as_str().into(),
        rport.clone(),
        rport,
        ports.clone(),
        ports,
        i64::from(fp.threads).into(),
    ]
}

/// A `running` record whose claim is older than the bound cutoff. Binds the
/// running status and the cutoff in epoch milliseconds.
const STALE_CLAIM: &str = "(status = ? AND (claimed_at IS NULL OR claimed_at < ?))";

fn status_list(statuses: &[ScanStatus]) -> (String, Vec<SqlValue>) {
    let placeholders = vec!["?"; statuses.len()].join(", ");
    let values = statuses.iter().map(|s| SqlValue::from(s.as_str())).collect();
    (placeholders, values)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Acquired(i64),
    Cached(String),
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    Rejected { unknown_columns: Vec<String> },
    Failed(String),
}

impl InsertOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

#[derive(Debug, Clone)]
pub struct ResultCache {
    database_url: String,
    table: SqlIdent,
    schema: TableSchema,
}

impl ResultCache {
    pub fn new(
        database_url: impl Into<String>,
        table: &str,
        schema: TableSchema,
    ) -> Result<Self, CacheError> {
        Ok(Self {
            database_url: database_url.into(),
            table: SqlIdent::parse(table)?,
            schema,
        })
    }

    pub fn for_today(database_url: impl Into<String>) -> Result<Self, CacheError> {
        let table = daily_table_name(chrono::Local::now().date_naive());
        Self::new(database_url, &table, TableSchema::default())
    }

    pub fn table(&self) -> &str {
        self.table.as_str()
    }

    async fn connect(&self) -> Result<SqliteConnection, sqlx::Error> {
        SqliteConnectOptions::from_str(&self.database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(10))
            .connect()
            .await
    }

    /// Creates the table unless it already exists. An existing table is
    /// accepted as-is, whatever its columns.
    pub async fn ensure_table(&self) -> Result<(), CacheError> {
        let mut conn = self.connect().await?;
        let existing: Option<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' AND name=?")
                .bind(self.table.as_str())
                .fetch_optional(&mut conn)
                .await?;
        if existing.is_some() {
            debug!(table = %self.table, "result table already exists");
            return Ok(());
        }

        let ddl = self.schema.create_statement(&self.table);
        let mut tx = conn.begin().await?;
        if let Err(source) = sqlx::query(&ddl).execute(&mut *tx).await {
            error!(table = %self.table, error = %source, "result table creation failed");
            let _ = tx.rollback().await;
            return Err(CacheError::CreateTable {
                table: self.table.to_string(),
                source,
            });
        }
        tx.commit().await?;
        info!(table = %self.table, "result table created");
        Ok(())
    }

    pub async fn lookup(&self, fp: &ScanFingerprint) -> Result<Option<String>, CacheError> {
        let mut conn = self.connect().await?;
        Ok(self.lookup_on(&mut conn, fp).await?)
    }

    async fn lookup_on(
        &self,
        conn: &mut SqliteConnection,
        fp: &ScanFingerprint,
    ) -> Result<Option<String>, sqlx::Error> {
        let sql = format!(
            "SELECT COALESCE(compressed_output, output, '') AS stored FROM {} \
             WHERE status = ? AND {FINGERPRINT_MATCH} ORDER BY id LIMIT 1",
            self.table
        );
        let mut params: Vec<SqlValue> = vec![ScanStatus::Completed.as_str().into()];
        params.extend(fingerprint_params(fp));
        let row = bind_all(sqlx::query(&sql), &params)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(|r| r.try_get::<String, _>("stored")).transpose()
    }

    /// Atomically marks `fp` as `running`.
    ///
    /// A `timeout`/`failed` record (and a `completed` one when `refresh` is
    /// set) is reclaimed in place; otherwise a new row is inserted, unless a
    /// record that blocks the claim already exists. A `running` record claimed
    /// more than `stale_after` ago belongs to a session that never finished
    /// and is reclaimable too.
    pub async fn claim(
        &self,
        fp: &ScanFingerprint,
        refresh: bool,
        stale_after: Duration,
    ) -> Result<Claim, CacheError> {
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        match self.claim_on(&mut tx, fp, refresh, stale_after).await {
            Ok(claim) => {
                tx.commit().await?;
                Ok(claim)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e.into())
            }
        }
    }

    async fn claim_on(
        &self,
        conn: &mut SqliteConnection,
        fp: &ScanFingerprint,
        refresh: bool,
        stale_after: Duration,
    ) -> Result<Claim, sqlx::Error> {
        let (reclaimable, blocking) = if refresh {
            (
                &[ScanStatus::Timeout, ScanStatus::Failed, ScanStatus::Completed][..],
                &[ScanStatus::Running][..],
            )
        } else {
            (
                &[ScanStatus::Timeout, ScanStatus::Failed][..],
                &[ScanStatus::Running, ScanStatus::Completed][..],
            )
        };
        let (reclaim_in, reclaim_values) = status_list(reclaimable);
        let (blocking_in, blocking_values) = status_list(blocking);

        let now = chrono::Utc::now().timestamp_millis();
        let stale_ms = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);
        let stale: [SqlValue; 2] = [
            ScanStatus::Running.as_str().into(),
            now.saturating_sub(stale_ms).into(),
        ];

        let reclaim = format!(
            "UPDATE {t} SET status = ?, claimed_at = ? WHERE id = \
               (SELECT id FROM {t} WHERE (status IN ({reclaim_in}) OR {STALE_CLAIM}) \
                AND {FINGERPRINT_MATCH} ORDER BY id LIMIT 1) \
             AND NOT EXISTS \
               (SELECT 1 FROM {t} WHERE status IN ({blocking_in}) AND NOT {STALE_CLAIM} \
                AND {FINGERPRINT_MATCH}) \
             RETURNING id",
            t = self.table
        );
        let mut params: Vec<SqlValue> = vec![ScanStatus::Running.as_str().into(), now.into()];
        params.extend(reclaim_values);
        params.extend(stale.iter().cloned());
        params.extend(fingerprint_params(fp));
        params.extend(blocking_values);
        params.extend(stale.iter().cloned());
        params.extend(fingerprint_params(fp));
        if let Some(row) = bind_all(sqlx::query(&reclaim), &params)
            .fetch_optional(&mut *conn)
            .await?
        {
            let id: i64 = row.try_get("id")?;
            debug!(table = %self.table, id, "reclaimed scan record");
            return Ok(Claim::Acquired(id));
        }

        let insert = format!(
            "INSERT INTO {t} (status, host, module, rport, ports, threads, claimed_at) \
             SELECT ?, ?, ?, ?, ?, ?, ? \
             WHERE NOT EXISTS (SELECT 1 FROM {t} WHERE status <> ? AND {FINGERPRINT_MATCH}) \
             RETURNING id",
            t = self.table
        );
        let mut params: Vec<SqlValue> = vec![
            ScanStatus::Running.as_str().into(),
            fp.rhosts.as_str().into(),
            fp.module.as_str().into(),
            SqlValue::from(fp.rport.map(i64::from)),
            SqlValue::from(fp.ports.clone()),
            i64::from(fp.threads).into(),
            now.into(),
            ScanStatus::New.as_str().into(),
        ];
        params.extend(fingerprint_params(fp));
        if let Some(row) = bind_all(sqlx::query(&insert), &params)
            .fetch_optional(&mut *conn)
            .await?
        {
            let id: i64 = row.try_get("id")?;
            debug!(table = %self.table, id, "inserted running scan record");
            return Ok(Claim::Acquired(id));
        }

        match self.lookup_on(conn, fp).await? {
            Some(output) if !refresh => Ok(Claim::Cached(output)),
            _ => Ok(Claim::InFlight),
        }
    }

    /// Inserts one row. Columns are checked against the live table first; an
    /// unknown column rejects the whole row.
    pub async fn insert_row(&self, values: &[(&str, SqlValue)]) -> InsertOutcome {
        match self.try_insert_row(values).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(table = %self.table, error = %e, "insert failed");
                InsertOutcome::Failed(e.to_string())
            }
        }
    }

    async fn try_insert_row(
        &self,
        values: &[(&str, SqlValue)],
    ) -> Result<InsertOutcome, sqlx::Error> {
        let mut conn = self.connect().await?;
        let table_columns: HashSet<String> =
            sqlx::query(&format!("PRAGMA table_info({})", self.table))
                .fetch_all(&mut conn)
                .await?
                .iter()
                .map(|row| row.try_get::<String, _>("name").map(|n| n.to_lowercase()))
                .collect::<Result<_, _>>()?;

        let unknown_columns: Vec<String> = values
            .iter()
            .map(|(name, _)| name.to_lowercase())
            .filter(|name| !table_columns.contains(name))
            .collect();
        if !unknown_columns.is_empty() {
            warn!(table = %self.table, ?unknown_columns, "insert references unknown columns");
            return Ok(InsertOutcome::Rejected { unknown_columns });
        }

        let columns: Vec<String> = values
            .iter()
            .map(|(name, _)| format!("\"{}\"", name.to_lowercase()))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            columns.join(", "),
            vec!["?"; values.len()].join(", ")
        );
        let params: Vec<SqlValue> = values.iter().map(|(_, v)| v.clone()).collect();

        let mut tx = conn.begin().await?;
        match bind_all(sqlx::query(&sql), &params).execute(&mut *tx).await {
            Ok(done) => {
                tx.commit().await?;
                debug!(table = %self.table, id = done.last_insert_rowid(), "row inserted");
                Ok(InsertOutcome::Inserted(done.last_insert_rowid()))
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    pub async fn upsert(&self, record: &ScanRecord) -> bool {
        let duration = SqlValue::Real(record.duration.as_secs_f64());
        let Some(id) = record.id else {
            let fp = &record.fingerprint;
            let row: [(&str, SqlValue); 9] = [
                ("status", record.status.as_str().into()),
                ("host", fp.rhosts.as_str().into()),
                ("module", fp.module.as_str().into()),
                ("rport", SqlValue::from(fp.rport.map(i64::from))),
                ("ports", SqlValue::from(fp.ports.clone())),
                ("threads", i64::from(fp.threads).into()),
                ("duration", duration),
                ("output", record.output.as_str().into()),
                ("compressed_output", record.compressed_output.clone().into()),
            ];
            return self.insert_row(&row).await.is_inserted();
        };

        let sql = format!(
            "UPDATE {} SET status = ?, duration = ?, output = ?, compressed_output = ? WHERE id = ?",
            self.table
        );
        let params: [SqlValue; 5] = [
            record.status.as_str().into(),
            duration,
            record.output.as_str().into(),
            record.compressed_output.clone().into(),
            id.into(),
        ];
        self.mutate("upsert", &sql, &params).await
    }

    pub async fn set_status(&self, id: i64, status: ScanStatus) -> bool {
        let sql = format!("UPDATE {} SET status = ? WHERE id = ?", self.table);
        self.mutate("set_status", &sql, &[status.as_str().into(), id.into()])
            .await
    }

    pub async fn set_output(&self, id: i64, output: &str) -> bool {
        let sql = format!("UPDATE {} SET output = ? WHERE id = ?", self.table);
        self.mutate("set_output", &sql, &[output.into(), id.into()])
            .await
    }

    async fn mutate(&self, op: &'static str, sql: &str, params: &[SqlValue]) -> bool {
        match self.try_mutate(sql, params).await {
            Ok(1) => true,
            Ok(rows) => {
                warn!(table = %self.table, op, rows, "update did not touch exactly one row");
                false
            }
            Err(e) => {
                error!(table = %self.table, op, error = %e, "update failed");
                false
            }
        }
    }

    async fn try_mutate(&self, sql: &str, params: &[SqlValue]) -> Result<u64, sqlx::Error> {
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        match bind_all(sqlx::query(sql), params).execute(&mut *tx).await {
            Ok(done) => {
                tx.commit().await?;
                Ok(done.rows_affected())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    pub async fn output_by_id(&self, id: i64) -> Option<String> {
        match self.try_output_by_id(id).await {
            Ok(output) => output,
            Err(e) => {
                error!(table = %self.table, id, error = %e, "output lookup failed");
                None
            }
        }
    }

    async fn try_output_by_id(&self, id: i64) -> Result<Option<String>, sqlx::Error> {
        let mut conn = self.connect().await?;
        let sql = format!("SELECT output FROM {} WHERE id = ?", self.table);
        let output: Option<Option<String>> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(&mut conn)
            .await?;
        Ok(output.flatten())
    }

    pub async fn ids_by_status(&self, status: ScanStatus) -> Vec<i64> {
        match self.try_ids_by_status(status).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(table = %self.table, %status, error = %e, "status query failed");
                Vec::new()
            }
        }
    }

    async fn try_ids_by_status(&self, status: ScanStatus) -> Result<Vec<i64>, sqlx::Error> {
        let mut conn = self.connect().await?;
        let sql = format!("SELECT id FROM {} WHERE status = ? ORDER BY id", self.table);
        let ids: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(status.as_str())
            .fetch_all(&mut conn)
            .await?;
        Ok(ids)
    }

    pub async fn completed_results(&self) -> Vec<CompletedResult> {
        match self.try_completed_results().await {
            Ok(rows) => rows,
            Err(e) => {
                error!(table = %self.table, error = %e, "completed results query failed");
                Vec::new()
            }
        }
    }

    async fn try_completed_results(&self) -> Result<Vec<CompletedResult>, sqlx::Error> {
        let mut conn = self.connect().await?;
        let sql = format!(
            "SELECT host, module, COALESCE(compressed_output, output) AS output \
             FROM {} WHERE status = ? ORDER BY id",
            self.table
        );
        let rows = sqlx::query_as::<_, CompletedResult>(&sql)
            .bind(ScanStatus::Completed.as_str())
            .fetch_all(&mut conn)
            .await?;
        Ok(rows)
    }
}
