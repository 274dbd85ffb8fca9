use crate::error::{IngestError, SearchError};
use crate::language::TextSearchLanguage;
use crate::models::{
    BranchRankings, ChunkDisplay, ChunkKey, NewUpload, PersistedUpload, QueueEntry, RankedChunk,
};
use crate::traits::{
    ChunkIndex, Failure, QueueClaim, QueueStore, RankingRequest, ReleaseOutcome,
};
use async_trait::async_trait;
use pgvector::Vector;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config, NoTls, Row};
use tracing::{debug, warn};

type SqlParam = Box<dyn ToSql + Sync + Send>;

const QUEUE_COLUMNS: &str = "uploading_id, requester_id, vetrina_id, raw_bytes, display_name, \
     extension, tag, upload_time, failed, attempts, last_error";

/// Postgres + pgvector backend for the upload queue and the chunk index.
pub struct PgStore {
    config: Config,
    client: Client,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, tokio_postgres::Error> {
        let config: Config = database_url.parse()?;
        let client = open_connection(&config).await?;
        Ok(Self { config, client })
    }

    /// Creates the extension, tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self, dimensions: usize) -> Result<(), IngestError> {
        if dimensions == 0 {
            return Err(IngestError::Validation(
                "embedding dimensions must be positive".to_string(),
            ));
        }

        self.client
            .batch_execute("CREATE EXTENSION IF NOT EXISTS vector")
            .await?;

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS users (
                user_id BIGSERIAL PRIMARY KEY,
                username TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS course_instances (
                instance_id BIGSERIAL PRIMARY KEY,
                course_name TEXT NOT NULL,
                faculty_name TEXT NOT NULL,
                canale TEXT NOT NULL DEFAULT '0',
                course_year INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS vetrina (
                vetrina_id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                author_id BIGINT NOT NULL REFERENCES users(user_id),
                course_instance_id BIGINT NOT NULL REFERENCES course_instances(instance_id)
            );
            CREATE TABLE IF NOT EXISTS files (
                file_id BIGSERIAL PRIMARY KEY,
                vetrina_id BIGINT NOT NULL REFERENCES vetrina(vetrina_id) ON DELETE CASCADE,
                display_name TEXT NOT NULL,
                extension TEXT NOT NULL,
                tag TEXT,
                size_bytes BIGINT NOT NULL,
                sha256 TEXT NOT NULL,
                stored_key TEXT NOT NULL,
                redacted_key TEXT,
                page_count INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (vetrina_id, sha256)
            );
            CREATE TABLE IF NOT EXISTS chunk_embeddings (
                chunk_id BIGSERIAL PRIMARY KEY,
                vetrina_id BIGINT NOT NULL REFERENCES vetrina(vetrina_id) ON DELETE CASCADE,
                file_id BIGINT NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
                page_number INTEGER NOT NULL CHECK (page_number >= 1),
                chunk_description TEXT NOT NULL,
                chunk_context TEXT NOT NULL,
                embedding VECTOR({dimensions}) NOT NULL,
                image_key TEXT NOT NULL,
                window_score REAL NOT NULL,
                UNIQUE (vetrina_id, file_id, page_number, chunk_description)
            );
            CREATE TABLE IF NOT EXISTS upload_queue (
                uploading_id BIGSERIAL PRIMARY KEY,
                requester_id BIGINT NOT NULL,
                vetrina_id BIGINT NOT NULL,
                raw_bytes BYTEA NOT NULL,
                display_name TEXT NOT NULL,
                extension TEXT NOT NULL,
                tag TEXT,
                upload_time TIMESTAMPTZ NOT NULL DEFAULT now(),
                failed BOOLEAN NOT NULL DEFAULT FALSE,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS upload_queue_pending_idx
                ON upload_queue (upload_time, uploading_id) WHERE NOT failed;
            CREATE INDEX IF NOT EXISTS chunk_embeddings_embedding_idx
                ON chunk_embeddings USING hnsw (embedding vector_cosine_ops);"
        );
        self.client.batch_execute(&ddl).await?;

        // Expression indexes need the configuration as a literal; it comes from the closed table.
        for language in TextSearchLanguage::all() {
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS chunk_embeddings_{code}_tsv_idx ON chunk_embeddings \
                 USING GIN ({document})",
                code = language.code(),
                document = document_vector(language, "chunk_description"),
            );
            self.client.batch_execute(&sql).await?;
        }

        debug!(dimensions, "schema ensured");
        Ok(())
    }
}

async fn open_connection(config: &Config) -> Result<Client, tokio_postgres::Error> {
    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        if let Err(error) = connection.await {
            warn!(%error, "postgres connection error");
        }
    });
    Ok(client)
}

fn persistence_error(error: tokio_postgres::Error) -> IngestError {
    if error.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        IngestError::PersistenceConflict(error.to_string())
    } else {
        IngestError::Database(error)
    }
}

fn to_i32(value: u32, field: &str) -> Result<i32, IngestError> {
    i32::try_from(value)
        .map_err(|_| IngestError::Validation(format!("{field} {value} does not fit the schema")))
}

fn queue_entry_from_row(row: &Row) -> Result<QueueEntry, IngestError> {
    let attempts: i32 = row.try_get("attempts")?;
    Ok(QueueEntry {
        uploading_id: row.try_get("uploading_id")?,
        requester_id: row.try_get("requester_id")?,
        vetrina_id: row.try_get("vetrina_id")?,
        raw_bytes: row.try_get("raw_bytes")?,
        display_name: row.try_get("display_name")?,
        extension: row.try_get("extension")?,
        tag: row.try_get("tag")?,
        upload_time: row.try_get("upload_time")?,
        failed: row.try_get("failed")?,
        attempts: u32::try_from(attempts).unwrap_or_default(),
        last_error: row.try_get("last_error")?,
    })
}

#[async_trait]
impl QueueStore for PgStore {
    type Claim = PgClaim;

    async fn enqueue(&self, upload: NewUpload) -> Result<i64, IngestError> {
        let row = self
            .client
            .query_one(
                "INSERT INTO upload_queue (requester_id, vetrina_id, raw_bytes, display_name, extension, tag)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 RETURNING uploading_id",
                &[
                    &upload.requester_id,
                    &upload.vetrina_id,
                    &upload.raw_bytes,
                    &upload.display_name,
                    &upload.extension.to_ascii_lowercase(),
                    &upload.tag,
                ],
            )
            .await
            .map_err(persistence_error)?;
        Ok(row.try_get(0)?)
    }

    async fn pending_count(&self) -> Result<u64, IngestError> {
        let row = self
            .client
            .query_one("SELECT COUNT(*) FROM upload_queue WHERE NOT failed", &[])
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn claim_next(&self, exclude: &[i64]) -> Result<Option<PgClaim>, IngestError> {
        // One connection per claim: the row lock lives exactly as long as its transaction.
        let client = open_connection(&self.config).await?;
        client.batch_execute("BEGIN").await?;

        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM upload_queue
             WHERE NOT failed AND NOT (uploading_id = ANY($1))
             ORDER BY upload_time, uploading_id
             LIMIT 1
             FOR UPDATE SKIP LOCKED"
        );
        let row = client.query_opt(&sql, &[&exclude]).await?;
        let Some(row) = row else {
            client.batch_execute("ROLLBACK").await?;
            return Ok(None);
        };

        let entry = queue_entry_from_row(&row)?;
        client.batch_execute("SAVEPOINT unit_of_work").await?;
        Ok(Some(PgClaim { client, entry }))
    }

    async fn requeue_failed(&self, uploading_id: i64) -> Result<bool, IngestError> {
        let updated = self
            .client
            .execute(
                "UPDATE upload_queue SET failed = FALSE, attempts = 0, last_error = NULL
                 WHERE uploading_id = $1 AND failed",
                &[&uploading_id],
            )
            .await?;
        Ok(updated > 0)
    }
}

/// A locked queue row plus the open transaction that guards it.
///
/// Dropping the claim closes its connection, which rolls the transaction back.
pub struct PgClaim {
    client: Client,
    entry: QueueEntry,
}

impl PgClaim {
    async fn write(&self, upload: &PersistedUpload) -> Result<i64, IngestError> {
        let file = &upload.file;
        let size_bytes = i64::try_from(file.size_bytes).map_err(|_| {
            IngestError::Validation(format!("file of {} bytes is too large", file.size_bytes))
        })?;
        let row = self
            .client
            .query_one(
                "INSERT INTO files (vetrina_id, display_name, extension, tag, size_bytes, sha256,
                                    stored_key, redacted_key, page_count)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 RETURNING file_id",
                &[
                    &file.vetrina_id,
                    &file.display_name,
                    &file.extension,
                    &file.tag,
                    &size_bytes,
                    &file.sha256,
                    &file.stored_key,
                    &file.redacted_key,
                    &to_i32(file.page_count, "page_count")?,
                ],
            )
            .await
            .map_err(persistence_error)?;
        let file_id: i64 = row.try_get(0)?;

        let statement = self
            .client
            .prepare(
                "INSERT INTO chunk_embeddings (vetrina_id, file_id, page_number, chunk_description,
                                               chunk_context, embedding, image_key, window_score)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .await?;
        for chunk in &upload.chunks {
            let embedding = Vector::from(chunk.embedding.clone());
            self.client
                .execute(
                    &statement,
                    &[
                        &file.vetrina_id,
                        &file_id,
                        &to_i32(chunk.page_number, "page_number")?,
                        &chunk.description,
                        &chunk.context,
                        &embedding,
                        &chunk.image_key,
                        &chunk.window_score,
                    ],
                )
                .await
                .map_err(persistence_error)?;
        }

        self.client
            .execute(
                "DELETE FROM upload_queue WHERE uploading_id = $1",
                &[&self.entry.uploading_id],
            )
            .await?;
        Ok(file_id)
    }
}

#[async_trait]
impl QueueClaim for PgClaim {
    fn entry(&self) -> &QueueEntry {
        &self.entry
    }

    async fn commit(&mut self, upload: PersistedUpload) -> Result<i64, IngestError> {
        let file_id = self.write(&upload).await?;
        self.client.batch_execute("COMMIT").await?;
        Ok(file_id)
    }

    async fn release(self, failure: &Failure) -> Result<ReleaseOutcome, IngestError> {
        let attempts = self.entry.attempts.saturating_add(1);
        let quarantined = failure.quarantines(attempts);

        self.client
            .batch_execute("ROLLBACK TO SAVEPOINT unit_of_work")
            .await?;
        self.client
            .execute(
                "UPDATE upload_queue SET attempts = $2, failed = $3, last_error = $4
                 WHERE uploading_id = $1",
                &[
                    &self.entry.uploading_id,
                    &i32::try_from(attempts).unwrap_or(i32::MAX),
                    &quarantined,
                    &failure.message,
                ],
            )
            .await?;
        self.client.batch_execute("COMMIT").await?;
        Ok(ReleaseOutcome {
            attempts,
            quarantined,
        })
    }
}

/// The fused hybrid query and its positional parameters.
pub(crate) struct HybridQuery {
    pub(crate) sql: String,
    pub(crate) params: Vec<SqlParam>,
}

impl HybridQuery {
    fn bind(&mut self, value: impl ToSql + Sync + Send + 'static) -> String {
        self.params.push(Box::new(value));
        format!("${}", self.params.len())
    }
}

/// The indexed full-text expression for one configuration.
fn document_vector(language: TextSearchLanguage, column: &str) -> String {
    format!("to_tsvector('{}'::regconfig, {column})", language.regconfig())
}

/// One arm per configuration, each guarded by the bound selector. Once the selector is known
/// the other arms fold away and the survivor matches its expression index.
fn keyword_match(config: &str, text: &str) -> String {
    TextSearchLanguage::all()
        .map(|language| {
            format!(
                "({config}::text = '{name}' AND {document} @@ plainto_tsquery('{name}'::regconfig, {text}::text))",
                name = language.regconfig(),
                document = document_vector(language, "ce.chunk_description"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n               OR ")
}

/// Builds the single round-trip query behind both retrieval branches.
///
/// The file table is joined into the filter set only when a file-level filter is present.
pub(crate) fn build_hybrid_query(request: &RankingRequest<'_>) -> HybridQuery {
    let mut query = HybridQuery {
        sql: String::new(),
        params: Vec::new(),
    };
    let filters = request.filters;
    let join_files = filters.has_file_filters();

    let text = query.bind(request.query_text.trim().to_string());
    let config = query.bind(request.language.regconfig().to_string());
    let keyword_limit = query.bind(request.keyword_limit as i64);
    let text_match = keyword_match(&config, &text);

    let mut conditions = Vec::new();
    if let Some(vetrina_id) = filters.vetrina_id {
        conditions.push(format!("v.vetrina_id = {}", query.bind(vetrina_id)));
    }
    if let Some(course_name) = &filters.course_name {
        conditions.push(format!("ci.course_name = {}", query.bind(course_name.clone())));
    }
    if let Some(faculty_name) = &filters.faculty_name {
        conditions.push(format!("ci.faculty_name = {}", query.bind(faculty_name.clone())));
    }
    if let Some(canale) = &filters.canale {
        conditions.push(format!("ci.canale = {}", query.bind(canale.clone())));
    }
    if let Some(course_year) = filters.course_year {
        conditions.push(format!("ci.course_year = {}", query.bind(course_year)));
    }
    if let Some(tag) = &filters.tag {
        conditions.push(format!("f.tag = {}", query.bind(tag.clone())));
    }
    if let Some(extension) = &filters.extension {
        conditions.push(format!(
            "lower(f.extension) = lower({})",
            query.bind(extension.clone())
        ));
    }

    let (file_column, file_join, file_match) = if join_files {
        (
            ", f.file_id",
            "\n        JOIN files f ON f.vetrina_id = v.vetrina_id",
            " AND fl.file_id = ce.file_id",
        )
    } else {
        ("", "", "")
    };
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("\n        WHERE {}", conditions.join(" AND "))
    };

    let mut sql = format!(
        "WITH filtered AS (
        SELECT v.vetrina_id{file_column}
        FROM vetrina v
        JOIN course_instances ci ON ci.instance_id = v.course_instance_id{file_join}{where_clause}
    ),
    text_query AS (
        SELECT {config}::text::regconfig AS config,
               plainto_tsquery({config}::text::regconfig, {text}::text) AS query
    ),
    keyword AS (
        SELECT hit.*, ROW_NUMBER() OVER (
            ORDER BY hit.relevance DESC, hit.vetrina_id, hit.file_id, hit.page_number, hit.chunk_description
        ) AS rank
        FROM (
            SELECT ce.vetrina_id, ce.file_id, ce.page_number, ce.chunk_description,
                   ts_rank(to_tsvector(q.config, ce.chunk_description), q.query) AS relevance
            FROM chunk_embeddings ce
            JOIN filtered fl ON fl.vetrina_id = ce.vetrina_id{file_match}
            CROSS JOIN text_query q
            WHERE {text_match}
            ORDER BY relevance DESC, ce.vetrina_id, ce.file_id, ce.page_number, ce.chunk_description
            LIMIT {keyword_limit}
        ) hit
    )"
    );

    let semantic_arm = match request.query_vector {
        Some(vector) => {
            let vector = query.bind(Vector::from(vector.to_vec()));
            let semantic_limit = query.bind(request.semantic_limit as i64);
            sql.push_str(&format!(
                ",
    semantic AS (
        SELECT hit.*, ROW_NUMBER() OVER (
            ORDER BY hit.distance, hit.vetrina_id, hit.file_id, hit.page_number, hit.chunk_description
        ) AS rank
        FROM (
            SELECT ce.vetrina_id, ce.file_id, ce.page_number, ce.chunk_description,
                   ce.embedding <=> {vector} AS distance
            FROM chunk_embeddings ce
            JOIN filtered fl ON fl.vetrina_id = ce.vetrina_id{file_match}
            ORDER BY distance, ce.vetrina_id, ce.file_id, ce.page_number, ce.chunk_description
            LIMIT {semantic_limit}
        ) hit
    )"
            ));
            "SELECT 'semantic' AS branch, rank, vetrina_id, file_id, page_number, chunk_description FROM semantic
        UNION ALL\n        "
        }
        None => "",
    };

    sql.push_str(&format!(
        "
    SELECT ranked.branch, ranked.rank, ranked.vetrina_id, ranked.file_id, ranked.page_number,
           ranked.chunk_description, v.name AS vetrina_name, u.username AS author_username,
           ci.course_name, f.display_name AS file_name
    FROM (
        {semantic_arm}SELECT 'keyword' AS branch, rank, vetrina_id, file_id, page_number, chunk_description FROM keyword
    ) ranked
    JOIN files f ON f.file_id = ranked.file_id
    JOIN vetrina v ON v.vetrina_id = ranked.vetrina_id
    JOIN users u ON u.user_id = v.author_id
    JOIN course_instances ci ON ci.instance_id = v.course_instance_id
    ORDER BY ranked.branch, ranked.rank"
    ));

    query.sql = sql;
    query
}

fn backend_error(details: impl Into<String>) -> SearchError {
    SearchError::BackendResponse {
        backend: "postgres".to_string(),
        details: details.into(),
    }
}

fn ranked_chunk_from_row(row: &Row) -> Result<(String, i64, RankedChunk), SearchError> {
    let page_number: i32 = row.try_get("page_number")?;
    let page_number = u32::try_from(page_number)
        .map_err(|_| backend_error(format!("negative page number {page_number}")))?;
    let chunk = RankedChunk {
        key: ChunkKey {
            vetrina_id: row.try_get("vetrina_id")?,
            file_id: row.try_get("file_id")?,
            page_number,
            description: row.try_get("chunk_description")?,
        },
        display: ChunkDisplay {
            vetrina_name: row.try_get("vetrina_name")?,
            author_username: row.try_get("author_username")?,
            course_name: row.try_get("course_name")?,
            file_name: row.try_get("file_name")?,
        },
    };
    Ok((row.try_get("branch")?, row.try_get("rank")?, chunk))
}

#[async_trait]
impl ChunkIndex for PgStore {
    async fn rank_candidates(
        &self,
        request: &RankingRequest<'_>,
    ) -> Result<BranchRankings, SearchError> {
        let query = build_hybrid_query(request);
        let params: Vec<&(dyn ToSql + Sync)> = query
            .params
            .iter()
            .map(|param| param.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = self.client.query(query.sql.as_str(), &params).await?;

        let mut semantic = Vec::new();
        let mut keyword = Vec::new();
        for row in &rows {
            let (branch, rank, chunk) = ranked_chunk_from_row(row)?;
            match branch.as_str() {
                "semantic" => semantic.push((rank, chunk)),
                "keyword" => keyword.push((rank, chunk)),
                other => return Err(backend_error(format!("unknown branch {other}"))),
            }
        }
        semantic.sort_by_key(|(rank, _)| *rank);
        keyword.sort_by_key(|(rank, _)| *rank);

        debug!(
            semantic = semantic.len(),
            keyword = keyword.len(),
            language = request.language.code(),
            "hybrid candidates fetched"
        );
        Ok(BranchRankings {
            semantic: semantic.into_iter().map(|(_, chunk)| chunk).collect(),
            keyword: keyword.into_iter().map(|(_, chunk)| chunk).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SearchFilters;

    fn request<'a>(
        filters: &'a SearchFilters,
        vector: Option<&'a [f32]>,
        language: TextSearchLanguage,
    ) -> RankingRequest<'a> {
        RankingRequest {
            query_text: "variance explanation",
            query_vector: vector,
            language,
            filters,
            semantic_limit: 50,
            keyword_limit: 50,
        }
    }

    #[test]
    fn file_table_is_only_joined_for_file_filters() {
        let filters = SearchFilters {
            course_name: Some("Statistica".to_string()),
            course_year: Some(2),
            ..Default::default()
        };
        let vector = [0.1f32, 0.2];
        let query = build_hybrid_query(&request(&filters, Some(&vector), TextSearchLanguage::English));
        assert!(!query.sql.contains("JOIN files f ON f.vetrina_id"));
        assert!(query.sql.contains("ci.course_name = $4"));
        assert!(query.sql.contains("ci.course_year = $5"));

        let filters = SearchFilters {
            extension: Some("pdf".to_string()),
            ..Default::default()
        };
        let query = build_hybrid_query(&request(&filters, Some(&vector), TextSearchLanguage::English));
        assert!(query.sql.contains("JOIN files f ON f.vetrina_id = v.vetrina_id"));
        assert!(query.sql.contains("fl.file_id = ce.file_id"));
    }

    #[test]
    fn text_configuration_is_bound_not_interpolated() {
        let filters = SearchFilters::default();
        let english = build_hybrid_query(&request(&filters, None, TextSearchLanguage::English));
        for language in TextSearchLanguage::all() {
            let query = build_hybrid_query(&request(&filters, None, language));
            assert_eq!(query.sql, english.sql);
            assert_eq!(
                format!("{:?}", query.params[1]),
                format!("{:?}", language.regconfig())
            );
        }
    }

    #[test]
    fn keyword_predicate_matches_the_expression_indexes() {
        let filters = SearchFilters::default();
        let query = build_hybrid_query(&request(&filters, None, TextSearchLanguage::Italian));
        for language in TextSearchLanguage::all() {
            let name = language.regconfig();
            let arm = format!(
                "($2::text = '{name}' AND to_tsvector('{name}'::regconfig, ce.chunk_description) \
                 @@ plainto_tsquery('{name}'::regconfig, $1::text))"
            );
            assert!(query.sql.contains(&arm), "missing arm for {name}");
            assert_eq!(
                document_vector(language, "chunk_description"),
                format!("to_tsvector('{name}'::regconfig, chunk_description)")
            );
        }
        assert!(!query.sql.contains("@@ q.query"));
    }

    #[test]
    fn semantic_branch_is_omitted_without_a_query_vector() {
        let filters = SearchFilters::default();
        let query = build_hybrid_query(&request(&filters, None, TextSearchLanguage::Italian));
        assert!(!query.sql.contains("semantic AS"));
        assert_eq!(query.params.len(), 3);

        let vector = [0.5f32; 4];
        let query = build_hybrid_query(&request(&filters, Some(&vector), TextSearchLanguage::Italian));
        assert!(query.sql.contains("semantic AS"));
        assert!(query.sql.contains("<=> $4"));
        assert_eq!(query.params.len(), 5);
    }
}
