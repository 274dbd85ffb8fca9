use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vetrina_core::{
    discover_pdf_files, enqueue_upload, pending_count, upload_from_path, Collaborators,
    Embedder, FsBlobStore, HashingEmbedder, HttpEmbedder, HttpPageRenderer, HttpScorerLoader,
    HttpSegmenter, HybridSearchEngine, IngestionOptions, IngestionWorker, PgStore, QueueStore,
    RedactionOptions, Redactor, RemoteConfig, RetryPolicy, ScopedModel, SearchFilters,
    SearchOptions, SearchQuery, DEFAULT_EMBEDDING_DIMENSIONS,
};

#[derive(Parser)]
#[command(name = "vetrina", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", default_value = "postgres://localhost/vetrina")]
    database_url: String,

    /// Embedding service base URL; the local hashing embedder is used when unset.
    #[arg(long, env = "VETRINA_EMBEDDER_URL")]
    embedder_url: Option<String>,

    /// Relevance scoring service base URL
    #[arg(long, env = "VETRINA_SCORER_URL")]
    scorer_url: Option<String>,

    /// Segmentation service base URL
    #[arg(long, env = "VETRINA_SEGMENTER_URL")]
    segmenter_url: Option<String>,

    /// Page rendering service base URL
    #[arg(long, env = "VETRINA_RENDERER_URL")]
    renderer_url: Option<String>,

    /// Bearer token sent to every inference service
    #[arg(long, env = "VETRINA_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Per-call timeout for inference services, in seconds
    #[arg(long, default_value = "120")]
    collaborator_timeout_secs: u64,

    /// Embedding vector length
    #[arg(long, default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    /// Root directory for stored, redacted and cropped artifacts
    #[arg(long, env = "VETRINA_STORAGE_DIR", default_value = "./vetrina-data")]
    storage_dir: PathBuf,
}

#[derive(Args)]
struct WorkerArgs {
    /// Attempts before a failing upload is quarantined
    #[arg(long, default_value = "3")]
    max_attempts: u32,
    /// Upper bound on uploads handled per pass
    #[arg(long)]
    max_entries_per_pass: Option<usize>,
    /// Wall-clock budget for one upload, in seconds
    #[arg(long, default_value = "600")]
    unit_timeout_secs: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Create tables, extensions and indexes.
    Migrate,
    /// Enqueue one PDF, or every PDF below a folder.
    Enqueue {
        /// PDF file or folder searched recursively
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        vetrina_id: i64,
        #[arg(long)]
        requester_id: i64,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Print the number of uploads waiting for a worker.
    Pending,
    /// Process the queue once until it is empty.
    Drain {
        #[command(flatten)]
        worker: WorkerArgs,
    },
    /// Drain the queue periodically until interrupted.
    Watch {
        #[command(flatten)]
        worker: WorkerArgs,
        #[arg(long, default_value = "60")]
        interval_secs: u64,
    },
    /// Clear the quarantine flag of an upload.
    Requeue {
        #[arg(long)]
        uploading_id: i64,
    },
    /// Hybrid semantic + full-text search over indexed chunks.
    Search {
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "20")]
        top_n: usize,
        /// Language hint (en, it); detected from the query when absent.
        #[arg(long)]
        language: Option<String>,
        #[arg(long)]
        vetrina_id: Option<i64>,
        #[arg(long)]
        course_name: Option<String>,
        #[arg(long)]
        faculty_name: Option<String>,
        #[arg(long)]
        canale: Option<String>,
        #[arg(long)]
        course_year: Option<i32>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        extension: Option<String>,
        /// Fall back to keyword-only results when the query cannot be embedded.
        #[arg(long, default_value_t = false)]
        keyword_only_on_embedding_failure: bool,
    },
    /// Write a copy of a PDF with the given pages blurred.
    Redact {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, value_delimiter = ',', default_value = "1")]
        pages: Vec<u32>,
    },
}

impl Cli {
    fn remote(&self, url: Option<&str>, name: &str) -> anyhow::Result<RemoteConfig> {
        let url = url.with_context(|| format!("{name} URL is required for this command"))?;
        let config = RemoteConfig::parse(
            url,
            self.api_key.clone(),
            Duration::from_secs(self.collaborator_timeout_secs),
        )
        .with_context(|| format!("invalid {name} URL {url}"))?;
        Ok(config)
    }

    fn embedder(&self) -> anyhow::Result<Arc<dyn Embedder>> {
        match self.embedder_url.as_deref() {
            Some(url) => {
                let config = self.remote(Some(url), "embedder")?;
                Ok(Arc::new(HttpEmbedder::new(config, self.embedding_dimensions)?))
            }
            None => {
                warn!("no embedder URL configured, using the local hashing embedder");
                Ok(Arc::new(HashingEmbedder {
                    dimensions: self.embedding_dimensions,
                }))
            }
        }
    }

    fn renderer(&self) -> anyhow::Result<HttpPageRenderer> {
        Ok(HttpPageRenderer::new(
            self.remote(self.renderer_url.as_deref(), "renderer")?,
        )?)
    }

    async fn worker(
        &self,
        args: &WorkerArgs,
    ) -> anyhow::Result<IngestionWorker<PgStore, HttpScorerLoader>> {
        let store = PgStore::connect(&self.database_url)
            .await
            .context("failed to connect to Postgres")?;
        let collaborators = Collaborators {
            embedder: self.embedder()?,
            scorer: ScopedModel::new(HttpScorerLoader::new(
                self.remote(self.scorer_url.as_deref(), "scorer")?,
            )?),
            segmenter: Arc::new(HttpSegmenter::new(
                self.remote(self.segmenter_url.as_deref(), "segmenter")?,
            )?),
            renderer: Arc::new(self.renderer()?),
            blobs: Arc::new(FsBlobStore::new(&self.storage_dir)),
        };
        let options = IngestionOptions {
            retry: RetryPolicy {
                max_attempts: args.max_attempts,
            },
            max_entries_per_pass: args.max_entries_per_pass,
            unit_timeout: Duration::from_secs(args.unit_timeout_secs),
            ..Default::default()
        };
        Ok(IngestionWorker::new(store, collaborators, options)?)
    }
}

async fn enqueue_path(
    store: &PgStore,
    path: &Path,
    vetrina_id: i64,
    requester_id: i64,
    tag: Option<String>,
) -> anyhow::Result<()> {
    let files = if path.is_dir() {
        discover_pdf_files(path)
    } else {
        vec![path.to_path_buf()]
    };
    if files.is_empty() {
        anyhow::bail!("no pdf files found in {}", path.display());
    }

    let mut skipped = 0usize;
    for file in &files {
        let result = async {
            let upload = upload_from_path(file, requester_id, vetrina_id, tag.clone()).await?;
            enqueue_upload(store, upload).await
        }
        .await;
        match result {
            Ok(uploading_id) => println!("{uploading_id}\t{}", file.display()),
            Err(error) => {
                skipped += 1;
                warn!(path = %file.display(), %error, "skipped pdf");
            }
        }
    }
    info!(enqueued = files.len() - skipped, skipped, "enqueue finished");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "vetrina boot"
    );

    match &cli.command {
        Command::Migrate => {
            let store = PgStore::connect(&cli.database_url).await?;
            store.ensure_schema(cli.embedding_dimensions).await?;
            println!("schema ready ({} dimensions)", cli.embedding_dimensions);
        }
        Command::Enqueue {
            path,
            vetrina_id,
            requester_id,
            tag,
        } => {
            let store = PgStore::connect(&cli.database_url).await?;
            enqueue_path(&store, path, *vetrina_id, *requester_id, tag.clone()).await?;
        }
        Command::Pending => {
            let store = PgStore::connect(&cli.database_url).await?;
            println!("{}", pending_count(&store).await?);
        }
        Command::Drain { worker } => {
            let report = cli.worker(worker).await?.drain().await?;
            println!(
                "persisted={} retried={} quarantined={}",
                report.persisted.len(),
                report.retried.len(),
                report.quarantined.len()
            );
        }
        Command::Watch {
            worker,
            interval_secs,
        } => {
            let worker = cli.worker(worker).await?;
            let interval = Duration::from_secs(*interval_secs);
            loop {
                match worker.drain().await {
                    Ok(report) if report.attempted() > 0 => {
                        info!(attempted = report.attempted(), "pass finished")
                    }
                    Ok(_) => {}
                    Err(error) => warn!(%error, "pass aborted"),
                }
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupted, stopping watch");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
        Command::Requeue { uploading_id } => {
            let store = PgStore::connect(&cli.database_url).await?;
            if store.requeue_failed(*uploading_id).await? {
                println!("upload {uploading_id} requeued");
            } else {
                anyhow::bail!("upload {uploading_id} is not quarantined");
            }
        }
        Command::Search {
            query,
            top_n,
            language,
            vetrina_id,
            course_name,
            faculty_name,
            canale,
            course_year,
            tag,
            extension,
            keyword_only_on_embedding_failure,
        } => {
            let store = PgStore::connect(&cli.database_url).await?;
            let options = SearchOptions {
                top_n: *top_n,
                keyword_only_on_embedding_failure: *keyword_only_on_embedding_failure,
                ..Default::default()
            };
            let engine = HybridSearchEngine::new(store, cli.embedder()?, options);
            let response = engine
                .search(&SearchQuery {
                    text: query.clone(),
                    filters: SearchFilters {
                        vetrina_id: *vetrina_id,
                        course_name: course_name.clone(),
                        faculty_name: faculty_name.clone(),
                        canale: canale.clone(),
                        course_year: *course_year,
                        tag: tag.clone(),
                        extension: extension.clone(),
                        language: language.clone(),
                    },
                })
                .await?;

            println!(
                "query: {} (language={}{})",
                response.query,
                response.language.code(),
                if response.degraded { ", keyword only" } else { "" }
            );
            for result in response.results {
                println!(
                    "score={:.5} semantic={:.5} keyword={:.5} vetrina={} file={} page={}",
                    result.combined_score,
                    result.semantic_score,
                    result.keyword_score,
                    result.vetrina_id,
                    result.file_id,
                    result.page_number
                );
                println!("  {}", result.chunk_description);
                println!(
                    "  {} / {} by {} ({})",
                    result.display.course_name,
                    result.display.vetrina_name,
                    result.display.author_username,
                    result.display.file_name
                );
            }
        }
        Command::Redact {
            input,
            output,
            pages,
        } => {
            let document = tokio::fs::read(input)
                .await
                .with_context(|| format!("failed to read {}", input.display()))?;
            let redactor = Redactor::new(Arc::new(cli.renderer()?), RedactionOptions::default());
            let redacted = redactor.redact(&document, pages).await?;
            tokio::fs::write(output, redacted)
                .await
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("{} -> {} (pages {:?})", input.display(), output.display(), pages);
        }
    }

    Ok(())
}
