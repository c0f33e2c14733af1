//! Collection orchestration: list posts, fetch and flatten reply trees, persist in batches.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rdc_adapters::{
    BackoffPolicy, ContentSource, FetchConfig, FetchStatus, ListingSort, RateLimitedFetcher,
    RedditClient, RedditConfig, SourceError,
};
use rdc_core::{flatten_comment_tree, CommentFilter, FlatComment, Post};
use rdc_storage::{
    ChunkConfig, MemoryStore, PgStore, PgStoreConfig, RecordStore, UpsertEngine, UpsertReport,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rdc-collect";

const REDDIT_VARS: [&str; 5] = ["USER_AGENT", "CLIENT_ID", "CLIENT_SECRET", "REDDIT_USER", "REDDIT_PASS"];
const DB_PART_VARS: [&str; 5] = ["DB_USER", "DB_PASSWORD", "DB_HOST", "DB_PORT", "DB_NAME"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("{key}={value:?} is not a valid {expected}")]
    Invalid {
        key: String,
        value: String,
        expected: &'static str,
    },
}

#[derive(Clone, Default)]
struct Credentials {
    user_agent: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    reddit_user: Option<String>,
    reddit_pass: Option<String>,
    database_url: Option<String>,
    db_user: Option<String>,
    db_password: Option<String>,
    db_host: Option<String>,
    db_port: Option<u16>,
    db_name: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credentials { .. }")
    }
}

#[derive(Debug, Clone)]
pub struct CollectConfig {
    pub forum: String,
    pub limit: usize,
    pub chunks: ChunkConfig,
    pub post_delay: Duration,
    pub fetch: FetchConfig,
    pub listing_sort: ListingSort,
    pub http_timeout: Duration,
    pub collect_cron: String,
    pub db_max_connections: u32,
    credentials: Credentials,
}

fn parse_var<T: FromStr>(
    key: &str,
    value: Option<String>,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
            expected,
        }),
    }
}

impl CollectConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let db_port = match get("DB_PORT") {
            None => None,
            Some(raw) => Some(parse_var("DB_PORT", Some(raw), 0u16, "port number")?),
        };
        let listing_sort = match get("RDC_LISTING_SORT") {
            None => ListingSort::default(),
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "RDC_LISTING_SORT".into(),
                value: raw,
                expected: "listing sort (new or hot)",
            })?,
        };

        let defaults = FetchConfig::default();
        let backoff_defaults = BackoffPolicy::default();

        Ok(Self {
            forum: get("RDC_FORUM").unwrap_or_else(|| "pennystocks".to_string()),
            limit: parse_var("RDC_LIMIT", get("RDC_LIMIT"), 10, "count")?,
            chunks: ChunkConfig {
                post_chunk_size: parse_var(
                    "RDC_POST_CHUNK_SIZE",
                    get("RDC_POST_CHUNK_SIZE"),
                    ChunkConfig::default().post_chunk_size,
                    "count",
                )?,
                comment_chunk_size: parse_var(
                    "RDC_COMMENT_CHUNK_SIZE",
                    get("RDC_COMMENT_CHUNK_SIZE"),
                    ChunkConfig::default().comment_chunk_size,
                    "count",
                )?,
            },
            post_delay: Duration::from_millis(parse_var(
                "RDC_POST_DELAY_MS",
                get("RDC_POST_DELAY_MS"),
                1000u64,
                "millisecond count",
            )?),
            fetch: FetchConfig {
                backoff: BackoffPolicy {
                    max_attempts: parse_var(
                        "RDC_FETCH_MAX_ATTEMPTS",
                        get("RDC_FETCH_MAX_ATTEMPTS"),
                        backoff_defaults.max_attempts,
                        "count",
                    )?,
                    base_delay: Duration::from_millis(parse_var(
                        "RDC_FETCH_BASE_DELAY_MS",
                        get("RDC_FETCH_BASE_DELAY_MS"),
                        backoff_defaults.base_delay.as_millis() as u64,
                        "millisecond count",
                    )?),
                    max_delay: backoff_defaults.max_delay,
                },
                reply_depth: parse_var(
                    "RDC_REPLY_DEPTH",
                    get("RDC_REPLY_DEPTH"),
                    defaults.reply_depth,
                    "count",
                )?,
                reply_breadth: parse_var(
                    "RDC_REPLY_BREADTH",
                    get("RDC_REPLY_BREADTH"),
                    defaults.reply_breadth,
                    "count",
                )?,
            },
            listing_sort,
            http_timeout: Duration::from_secs(parse_var(
                "RDC_HTTP_TIMEOUT_SECS",
                get("RDC_HTTP_TIMEOUT_SECS"),
                20u64,
                "second count",
            )?),
            collect_cron: get("RDC_COLLECT_CRON").unwrap_or_else(|| "0 */30 * * * *".to_string()),
            db_max_connections: parse_var(
                "RDC_DB_MAX_CONNECTIONS",
                get("RDC_DB_MAX_CONNECTIONS"),
                5u32,
                "count",
            )?,
            credentials: Credentials {
                user_agent: get("USER_AGENT"),
                client_id: get("CLIENT_ID"),
                client_secret: get("CLIENT_SECRET"),
                reddit_user: get("REDDIT_USER"),
                reddit_pass: get("REDDIT_PASS"),
                database_url: get("DATABASE_URL"),
                db_user: get("DB_USER"),
                db_password: get("DB_PASSWORD"),
                db_host: get("DB_HOST"),
                db_port,
                db_name: get("DB_NAME"),
            },
        })
    }

    pub fn missing_reddit_vars(&self) -> Vec<String> {
        let c = &self.credentials;
        let present = [
            c.user_agent.is_some(),
            c.client_id.is_some(),
            c.client_secret.is_some(),
            c.reddit_user.is_some(),
            c.reddit_pass.is_some(),
        ];
        REDDIT_VARS
            .iter()
            .zip(present)
            .filter(|(_, ok)| !ok)
            .map(|(key, _)| key.to_string())
            .collect()
    }

    /// Empty when `DATABASE_URL` is set; otherwise the unset `DB_*` parts.
    pub fn missing_database_vars(&self) -> Vec<String> {
        let c = &self.credentials;
        if c.database_url.is_some() {
            return Vec::new();
        }
        let present = [
            c.db_user.is_some(),
            c.db_password.is_some(),
            c.db_host.is_some(),
            c.db_port.is_some(),
            c.db_name.is_some(),
        ];
        DB_PART_VARS
            .iter()
            .zip(present)
            .filter(|(_, ok)| !ok)
            .map(|(key, _)| key.to_string())
            .collect()
    }

    /// Fail fast, reporting every missing variable at once.
    pub fn validate_for(&self, reddit: bool, database: bool) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if reddit {
            missing.extend(self.missing_reddit_vars());
        }
        if database {
            missing.extend(self.missing_database_vars());
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Missing(missing))
        }
    }

    pub fn reddit_config(&self) -> Result<RedditConfig, ConfigError> {
        self.validate_for(true, false)?;
        let c = &self.credentials;
        let mut config = RedditConfig::new(
            c.client_id.clone().unwrap_or_default(),
            c.client_secret.clone().unwrap_or_default(),
            c.reddit_user.clone().unwrap_or_default(),
            c.reddit_pass.clone().unwrap_or_default(),
            c.user_agent.clone().unwrap_or_default(),
        );
        config.timeout = self.http_timeout;
        config.listing_sort = self.listing_sort;
        Ok(config)
    }

    pub fn pg_store_config(&self) -> Result<PgStoreConfig, ConfigError> {
        self.validate_for(false, true)?;
        let c = &self.credentials;
        let mut config = match &c.database_url {
            Some(url) => PgStoreConfig::from_url(url).map_err(|err| ConfigError::Invalid {
                key: "DATABASE_URL".into(),
                value: err.to_string(),
                expected: "postgres connection url",
            })?,
            None => PgStoreConfig::from_parts(
                c.db_host.as_deref().unwrap_or_default(),
                c.db_port.unwrap_or(5432),
                c.db_user.as_deref().unwrap_or_default(),
                c.db_password.as_deref().unwrap_or_default(),
                c.db_name.as_deref().unwrap_or_default(),
            ),
        };
        config.max_connections = self.db_max_connections;
        Ok(config)
    }
}

/// Posts and flattened comments gathered in one pass over a forum.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub posts: Vec<Post>,
    pub comments: Vec<FlatComment>,
    pub throttled_posts: usize,
    pub failed_posts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadView {
    pub post: Post,
    pub fetch_status: FetchStatus,
    pub attempts: usize,
    pub comments: Vec<FlatComment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionSummary {
    pub run_id: Uuid,
    pub forum: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub posts_fetched: usize,
    pub comments_fetched: usize,
    pub posts_persisted: usize,
    pub comments_persisted: usize,
    pub post_batches: usize,
    pub comment_batches: usize,
    pub dangling_parents: usize,
    pub throttled_posts: usize,
    pub failed_posts: usize,
}

/// Walks a forum's posts strictly one at a time.
#[derive(Debug)]
pub struct Collector<S> {
    fetcher: RateLimitedFetcher<S>,
    filter: CommentFilter,
    post_delay: Duration,
}

impl<S: ContentSource> Collector<S> {
    pub fn new(fetcher: RateLimitedFetcher<S>, filter: CommentFilter, post_delay: Duration) -> Self {
        Self {
            fetcher,
            filter,
            post_delay,
        }
    }

    pub fn fetcher(&self) -> &RateLimitedFetcher<S> {
        &self.fetcher
    }

    /// A listing failure is an error; a failed or throttled post only loses its comments.
    pub async fn collect(&self, forum: &str, limit: usize) -> Result<Collection, SourceError> {
        let posts = self.fetcher.list_posts(forum, limit).await?;
        info!(forum, posts = posts.len(), "listed posts");

        let mut collection = Collection::default();
        for (index, post) in posts.iter().enumerate() {
            if index > 0 && !self.post_delay.is_zero() {
                tokio::time::sleep(self.post_delay).await;
            }

            let fetch = self.fetcher.fetch_comments(&post.id).await;
            match fetch.status {
                FetchStatus::Complete => {}
                FetchStatus::Throttled => collection.throttled_posts += 1,
                FetchStatus::Failed => collection.failed_posts += 1,
            }

            let flat = flatten_comment_tree(&fetch.replies, &self.filter);
            debug!(
                post_id = %post.id,
                roots = fetch.replies.len(),
                kept = flat.len(),
                attempts = fetch.attempts,
                "flattened comments"
            );
            collection.comments.extend(flat);
        }

        collection.posts = posts;
        Ok(collection)
    }

    pub async fn thread(&self, post_id: &str) -> Result<ThreadView, SourceError> {
        let post = self.fetcher.fetch_post(post_id).await?;
        let fetch = self.fetcher.fetch_comments(post_id).await;
        Ok(ThreadView {
            post,
            fetch_status: fetch.status,
            attempts: fetch.attempts,
            comments: flatten_comment_tree(&fetch.replies, &self.filter),
        })
    }
}

/// One full run: collect, then persist posts before comments so comment foreign keys resolve.
pub async fn run_collection<S, R>(
    collector: &Collector<S>,
    engine: &UpsertEngine<R>,
    forum: &str,
    limit: usize,
) -> Result<CollectionSummary>
where
    S: ContentSource,
    R: RecordStore,
{
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    async {
        info!(limit, "starting collection");
        let collection = collector
            .collect(forum, limit)
            .await
            .with_context(|| format!("listing posts for {forum}"))?;
        info!(
            posts = collection.posts.len(),
            comments = collection.comments.len(),
            "fetched posts and comments"
        );

        let (post_report, comment_report) = if collection.posts.is_empty() {
            info!("no posts to persist");
            (UpsertReport::default(), UpsertReport::default())
        } else {
            let posts = engine
                .upsert_posts(&collection.posts)
                .await
                .context("persisting posts")?;
            info!(rows = posts.rows, batches = posts.batches, "posts persisted");

            let comments = engine
                .upsert_comments(&collection.comments)
                .await
                .context("persisting comments")?;
            info!(
                rows = comments.rows,
                batches = comments.batches,
                dangling_parents = comments.dangling_parents,
                "comments persisted"
            );
            (posts, comments)
        };

        if collection.throttled_posts + collection.failed_posts > 0 {
            warn!(
                throttled = collection.throttled_posts,
                failed = collection.failed_posts,
                "some posts were stored without comments"
            );
        }

        Ok(CollectionSummary {
            run_id,
            forum: forum.to_string(),
            started_at,
            finished_at: Utc::now(),
            posts_fetched: collection.posts.len(),
            comments_fetched: collection.comments.len(),
            posts_persisted: post_report.rows,
            comments_persisted: comment_report.rows,
            post_batches: post_report.batches,
            comment_batches: comment_report.batches,
            dangling_parents: comment_report.dangling_parents,
            throttled_posts: collection.throttled_posts,
            failed_posts: collection.failed_posts,
        })
    }
    .instrument(info_span!("collection_run", %run_id, forum))
    .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTarget {
    Postgres,
    /// Validate the whole pipeline without touching a database.
    Memory,
}

pub fn build_collector(config: &CollectConfig) -> Result<Collector<RedditClient>> {
    let client = RedditClient::new(config.reddit_config()?).context("building reddit client")?;
    Ok(Collector::new(
        RateLimitedFetcher::new(client, config.fetch),
        CommentFilter::default(),
        config.post_delay,
    ))
}

pub async fn connect_store(config: &CollectConfig) -> Result<PgStore> {
    PgStore::connect(&config.pg_store_config()?)
        .await
        .context("connecting to postgres")
}

pub async fn collect_once(config: &CollectConfig, target: StoreTarget) -> Result<CollectionSummary> {
    config.validate_for(true, target == StoreTarget::Postgres)?;
    let collector = build_collector(config)?;

    match target {
        StoreTarget::Postgres => {
            let engine = UpsertEngine::new(connect_store(config).await?, config.chunks);
            let result = run_collection(&collector, &engine, &config.forum, config.limit).await;
            engine.store().close().await;
            result
        }
        StoreTarget::Memory => {
            let engine = UpsertEngine::new(MemoryStore::new(), config.chunks);
            run_collection(&collector, &engine, &config.forum, config.limit).await
        }
    }
}

pub async fn migrate(config: &CollectConfig) -> Result<()> {
    config.validate_for(false, true)?;
    let store = connect_store(config).await?;
    let result = store.migrate().await.context("applying migrations");
    store.close().await;
    result
}

pub async fn inspect_thread(config: &CollectConfig, post_id: &str) -> Result<ThreadView> {
    let collector = build_collector(config)?;
    collector
        .thread(post_id)
        .await
        .with_context(|| format!("fetching thread {post_id}"))
}

/// Run [`run_collection`] on `config.collect_cron` until Ctrl-C. Overlapping triggers are skipped.
pub async fn run_scheduled(config: &CollectConfig) -> Result<()> {
    config.validate_for(true, true)?;
    let collector = Arc::new(build_collector(config)?);
    let engine = Arc::new(UpsertEngine::new(connect_store(config).await?, config.chunks));
    let running = Arc::new(Mutex::new(()));
    let forum = config.forum.clone();
    let limit = config.limit;

    let mut sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_engine = engine.clone();
    let job = Job::new_async(config.collect_cron.as_str(), move |_uuid, _l| {
        let collector = collector.clone();
        let engine = job_engine.clone();
        let running = running.clone();
        let forum = forum.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous collection still running; skipping trigger");
                return;
            };
            match run_collection(&collector, &engine, &forum, limit).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    posts = summary.posts_persisted,
                    comments = summary.comments_persisted,
                    "scheduled collection finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled collection failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.collect_cron))?;

    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.collect_cron, forum = %config.forum, "scheduler running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    engine.store().close().await;
    Ok(())
}
