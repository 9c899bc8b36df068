use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{BulkOp, CandidateQuery, Catalog, ErrorLogEntry, FileUpdate, SortDirection};
use crate::error::Result;
use crate::types::{FileId, FileRecord, FileStatus, JobDescriptor, ProbeResult, SortFields};

/// `sqlx`-backed implementation of the catalog contract, over a `files`
/// table plus two append-only error tables. Queries are built with the
/// query-builder form of `sqlx::query`/`query_as` (not the `query!` macro)
/// since this crate has no compile-time database connection to check
/// against.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the schema if it does not already exist. Idempotent; safe
    /// to call on every startup.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id UUID PRIMARY KEY,
                path TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                encode_version TEXT NOT NULL DEFAULT '',
                probe JSONB,
                last_probe_at TIMESTAMPTZ,
                file_hash TEXT,
                audio_language TEXT[] NOT NULL DEFAULT '{}',
                integrity_checked BOOLEAN NOT NULL DEFAULT FALSE,
                compute_score DOUBLE PRECISION NOT NULL DEFAULT 0.125,
                permit_hw_decode BOOLEAN NOT NULL DEFAULT TRUE,
                reclaimed_space BIGINT NOT NULL DEFAULT 0,
                indexer_data JSONB,
                priority INTEGER NOT NULL DEFAULT 100,
                size_bytes BIGINT NOT NULL DEFAULT 0,
                width INTEGER NOT NULL DEFAULT 0,
                error JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS files_status_idx ON files (status);
            CREATE INDEX IF NOT EXISTS files_encode_version_idx ON files (encode_version);
            CREATE INDEX IF NOT EXISTS files_integrity_checked_idx ON files (integrity_checked);
            CREATE INDEX IF NOT EXISTS files_priority_idx ON files (priority);

            CREATE TABLE IF NOT EXISTS error_log (
                id BIGSERIAL PRIMARY KEY,
                path TEXT NOT NULL,
                reason TEXT NOT NULL,
                stderr_tail JSONB NOT NULL,
                cmdline TEXT,
                trace TEXT,
                occurred_at TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE IF NOT EXISTS integrity_error_log (
                id BIGSERIAL PRIMARY KEY,
                path TEXT NOT NULL,
                reason TEXT NOT NULL,
                stderr_tail JSONB NOT NULL,
                cmdline TEXT,
                trace TEXT,
                occurred_at TIMESTAMPTZ NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> sqlx::Result<FileRecord> {
        let id: Uuid = row.try_get("id")?;
        let status: String = row.try_get("status")?;
        let probe_json: Option<serde_json::Value> = row.try_get("probe")?;
        let indexer_json: Option<serde_json::Value> = row.try_get("indexer_data")?;
        let error_json: Option<serde_json::Value> = row.try_get("error")?;
        let audio_language: Vec<String> = row.try_get("audio_language")?;

        Ok(FileRecord {
            id: FileId(id),
            path: row.try_get("path")?,
            status: parse_status(&status),
            encode_version: row.try_get("encode_version")?,
            probe: probe_json.and_then(|v| serde_json::from_value::<ProbeResult>(v).ok()),
            last_probe_at: row.try_get("last_probe_at")?,
            file_hash: row.try_get("file_hash")?,
            audio_language: audio_language.into_iter().collect(),
            integrity_checked: row.try_get("integrity_checked")?,
            compute_score: row.try_get("compute_score")?,
            permit_hw_decode: row.try_get("permit_hw_decode")?,
            reclaimed_space: row.try_get("reclaimed_space")?,
            indexer_data: indexer_json,
            sort_fields: SortFields {
                priority: row.try_get("priority")?,
                size: row.try_get::<i64, _>("size_bytes")? as u64,
                width: row.try_get::<i32, _>("width")? as u32,
            },
            error: error_json.and_then(|v| serde_json::from_value(v).ok()),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn push_candidate_filters<'a>(
        mut builder: sqlx::QueryBuilder<'a, sqlx::Postgres>,
        query: &'a CandidateQuery,
    ) -> sqlx::QueryBuilder<'a, sqlx::Postgres> {
        let mut first = true;

        if let Some(status) = query.status {
            push_clause_sep(&mut builder, &mut first);
            builder.push("status = ").push_bind(status_str(status));
        }
        if let Some(ref ev) = query.encode_version_ne {
            push_clause_sep(&mut builder, &mut first);
            builder.push("encode_version <> ").push_bind(ev.clone());
        }
        if let Some(flag) = query.integrity_checked {
            push_clause_sep(&mut builder, &mut first);
            builder.push("integrity_checked = ").push_bind(flag);
        }
        if !query.exclude_ids.is_empty() {
            push_clause_sep(&mut builder, &mut first);
            let ids: Vec<Uuid> = query.exclude_ids.iter().map(|id| id.0).collect();
            builder.push("NOT (id = ANY(").push_bind(ids).push("))");
        }
        builder
    }

    fn order_clause(query: &CandidateQuery) -> &'static str {
        match (query.size_sort, query.width_sort) {
            (SortDirection::Ascending, SortDirection::Ascending) => {
                " ORDER BY priority ASC, size_bytes ASC, width ASC"
            }
            (SortDirection::Ascending, SortDirection::Descending) => {
                " ORDER BY priority ASC, size_bytes ASC, width DESC"
            }
            (SortDirection::Descending, SortDirection::Ascending) => {
                " ORDER BY priority ASC, size_bytes DESC, width ASC"
            }
            (SortDirection::Descending, SortDirection::Descending) => {
                " ORDER BY priority ASC, size_bytes DESC, width DESC"
            }
        }
    }
}

fn status_str(status: FileStatus) -> &'static str {
    match status {
        FileStatus::Pending => "pending",
        FileStatus::Complete => "complete",
        FileStatus::Deleted => "deleted",
        FileStatus::Error => "error",
        FileStatus::Ignore => "ignore",
    }
}

fn push_clause_sep(builder: &mut sqlx::QueryBuilder<'_, sqlx::Postgres>, first: &mut bool) {
    if *first {
        builder.push(" WHERE ");
        *first = false;
    } else {
        builder.push(" AND ");
    }
}

fn push_assignment_sep(builder: &mut sqlx::QueryBuilder<'_, sqlx::Postgres>, any: &mut bool) {
    if *any {
        builder.push(", ");
    }
    *any = true;
}

fn parse_status(s: &str) -> FileStatus {
    match s {
        "complete" => FileStatus::Complete,
        "deleted" => FileStatus::Deleted,
        "error" => FileStatus::Error,
        "ignore" => FileStatus::Ignore,
        _ => FileStatus::Pending,
    }
}

fn push_update_assignments<'a>(
    builder: &mut sqlx::QueryBuilder<'a, sqlx::Postgres>,
    patch: &'a FileUpdate,
) -> bool {
    let mut any = false;

    if let Some(status) = patch.status {
        push_assignment_sep(builder, &mut any);
        builder.push("status = ").push_bind(status_str(status));
    }
    if let Some(ref ev) = patch.encode_version {
        push_assignment_sep(builder, &mut any);
        builder.push("encode_version = ").push_bind(ev.clone());
    }
    if let Some(ref probe) = patch.probe {
        push_assignment_sep(builder, &mut any);
        builder.push("probe = ").push_bind(probe.clone());
    }
    if let Some(ts) = patch.last_probe_at {
        push_assignment_sep(builder, &mut any);
        builder.push("last_probe_at = ").push_bind(ts);
    }
    if let Some(ref hash) = patch.file_hash {
        push_assignment_sep(builder, &mut any);
        builder.push("file_hash = ").push_bind(hash.clone());
    }
    if let Some(ref langs) = patch.audio_language {
        push_assignment_sep(builder, &mut any);
        builder.push("audio_language = ").push_bind(langs.clone());
    }
    if let Some(flag) = patch.integrity_checked {
        push_assignment_sep(builder, &mut any);
        builder.push("integrity_checked = ").push_bind(flag);
    }
    if let Some(score) = patch.compute_score {
        push_assignment_sep(builder, &mut any);
        builder.push("compute_score = ").push_bind(score);
    }
    if let Some(flag) = patch.permit_hw_decode {
        push_assignment_sep(builder, &mut any);
        builder.push("permit_hw_decode = ").push_bind(flag);
    }
    if let Some(bytes) = patch.reclaimed_space {
        push_assignment_sep(builder, &mut any);
        builder.push("reclaimed_space = ").push_bind(bytes);
    }
    if let Some(ref indexer) = patch.indexer_data {
        push_assignment_sep(builder, &mut any);
        builder.push("indexer_data = ").push_bind(indexer.clone());
    }
    if let Some(priority) = patch.priority {
        push_assignment_sep(builder, &mut any);
        builder.push("priority = ").push_bind(priority);
    }
    if let Some(size) = patch.size_bytes {
        push_assignment_sep(builder, &mut any);
        builder.push("size_bytes = ").push_bind(size);
    }
    if let Some(width) = patch.width {
        push_assignment_sep(builder, &mut any);
        builder.push("width = ").push_bind(width);
    }
    if let Some(ref error) = patch.error {
        push_assignment_sep(builder, &mut any);
        builder.push("error = ").push_bind(error.clone());
    }
    if any {
        builder.push(", updated_at = now()");
    } else {
        builder.push("updated_at = now()");
        any = true;
    }
    any
}

#[async_trait::async_trait]
impl Catalog for PgCatalog {
    async fn find(&self, query: &CandidateQuery) -> Result<Vec<JobDescriptor>> {
        let mut builder = sqlx::QueryBuilder::new(
            "SELECT id, compute_score, priority, size_bytes, width, path FROM files",
        );
        builder = Self::push_candidate_filters(builder, query);
        builder.push(Self::order_clause(query));
        builder.push(" LIMIT ");
        builder.push_bind(query.limit);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(JobDescriptor {
                id: FileId(row.try_get("id")?),
                path: row.try_get("path")?,
                compute_score: row.try_get("compute_score")?,
                sort_fields: SortFields {
                    priority: row.try_get("priority")?,
                    size: row.try_get::<i64, _>("size_bytes")? as u64,
                    width: row.try_get::<i32, _>("width")? as u32,
                },
            });
        }
        Ok(out)
    }

    async fn find_one(&self, id: FileId) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM files WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(r) => Some(Self::row_to_record(&r)?),
            None => None,
        })
    }

    async fn find_one_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM files WHERE path = $1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(r) => Some(Self::row_to_record(&r)?),
            None => None,
        })
    }

    async fn count(&self, query: &CandidateQuery) -> Result<i64> {
        let mut builder = sqlx::QueryBuilder::new("SELECT count(*) AS n FROM files");
        builder = Self::push_candidate_filters(builder, query);
        let row = builder.build().fetch_one(&self.pool).await?;
        Ok(row.try_get("n")?)
    }

    async fn insert(&self, record: &FileRecord) -> Result<()> {
        let probe_json = record
            .probe
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let error_json = record
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let langs: Vec<String> = record.audio_language.iter().cloned().collect();
        sqlx::query(
            r#"
            INSERT INTO files (
                id, path, status, encode_version, probe, last_probe_at, file_hash,
                audio_language, integrity_checked, compute_score, permit_hw_decode,
                reclaimed_space, indexer_data, priority, size_bytes, width, error,
                created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19)
            ON CONFLICT (path) DO NOTHING
            "#,
        )
        .bind(record.id.0)
        .bind(&record.path)
        .bind(status_str(record.status))
        .bind(&record.encode_version)
        .bind(probe_json)
        .bind(record.last_probe_at)
        .bind(&record.file_hash)
        .bind(langs)
        .bind(record.integrity_checked)
        .bind(record.compute_score)
        .bind(record.permit_hw_decode)
        .bind(record.reclaimed_space)
        .bind(&record.indexer_data)
        .bind(record.sort_fields.priority)
        .bind(record.sort_fields.size as i64)
        .bind(record.sort_fields.width as i32)
        .bind(error_json)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_one(&self, id: FileId, patch: &FileUpdate) -> Result<()> {
        let mut builder = sqlx::QueryBuilder::new("UPDATE files SET ");
        push_update_assignments(&mut builder, patch);
        builder.push(" WHERE id = ");
        builder.push_bind(id.0);
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn update_many(&self, query: &CandidateQuery, patch: &FileUpdate) -> Result<u64> {
        let mut builder = sqlx::QueryBuilder::new("UPDATE files SET ");
        push_update_assignments(&mut builder, patch);
        builder = Self::push_candidate_filters(builder, query);
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn bulk_write(&self, ops: Vec<BulkOp>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for op in ops {
            match op {
                BulkOp::Update { id, patch } => {
                    let mut builder = sqlx::QueryBuilder::new("UPDATE files SET ");
                    push_update_assignments(&mut builder, &patch);
                    builder.push(" WHERE id = ");
                    builder.push_bind(id.0);
                    builder.build().execute(&mut *tx).await?;
                }
                BulkOp::Delete { id } => {
                    sqlx::query("DELETE FROM files WHERE id = $1")
                        .bind(id.0)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_many(&self, query: &CandidateQuery) -> Result<u64> {
        let mut builder = sqlx::QueryBuilder::new("DELETE FROM files");
        builder = Self::push_candidate_filters(builder, query);
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn status_counts(&self) -> Result<Vec<(FileStatus, i64)>> {
        let rows = sqlx::query("SELECT status, count(*) AS n FROM files GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            out.push((parse_status(&status), row.try_get("n")?));
        }
        Ok(out)
    }

    async fn total_reclaimed_space(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(SUM(reclaimed_space), 0) AS total FROM files")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    async fn append_error(&self, entry: &ErrorLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO error_log (path, reason, stderr_tail, cmdline, trace, occurred_at)
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(&entry.path)
        .bind(&entry.reason)
        .bind(serde_json::to_value(&entry.stderr_tail)?)
        .bind(&entry.cmdline)
        .bind(&entry.trace)
        .bind(entry.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_integrity_error(&self, entry: &ErrorLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO integrity_error_log (path, reason, stderr_tail, cmdline, trace, occurred_at)
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(&entry.path)
        .bind(&entry.reason)
        .bind(serde_json::to_value(&entry.stderr_tail)?)
        .bind(&entry.cmdline)
        .bind(&entry.trace)
        .bind(entry.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
