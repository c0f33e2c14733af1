//! Chunked upsert engine + record stores (PostgreSQL and in-memory) for RDC.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use rdc_core::{canonical_id, normalize_id, FlatComment, NormalizedId, Post};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "rdc-storage";

pub const DEFAULT_POST_CHUNK_SIZE: usize = 50;
pub const DEFAULT_COMMENT_CHUNK_SIZE: usize = 200;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("constraint violation: {0}")]
    Constraint(String),
}

/// A post exactly as written to the `posts` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRow {
    pub id: String,
    pub subreddit: String,
    pub title: String,
    pub body: Option<String>,
    pub author: String,
    pub created_utc: i64,
    pub score: i32,
}

impl PostRow {
    /// `None` when the post id cannot be normalized into a key.
    pub fn from_post(post: &Post) -> Option<Self> {
        Some(Self {
            id: canonical_id(Some(&post.id))?,
            subreddit: post.subreddit.clone(),
            title: post.title.clone(),
            body: post.body.clone(),
            author: post.author.as_stored().to_string(),
            created_utc: post.created_utc,
            score: clamp_score(post.score),
        })
    }
}

/// A comment exactly as written to the `comments` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentRow {
    pub id: String,
    pub body: String,
    pub author: String,
    pub created_utc: i64,
    pub parent_id: Option<String>,
    pub post_id: Option<String>,
    pub score: i32,
}

fn clamp_score(score: i64) -> i32 {
    i32::try_from(score).unwrap_or(if score < 0 { i32::MIN } else { i32::MAX })
}

/// Storage seam used by [`UpsertEngine`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Upsert one batch of posts as a single statement.
    async fn upsert_post_batch(&self, rows: &[PostRow]) -> Result<u64, StorageError>;

    /// Subset of `candidates` already persisted as comments.
    async fn existing_comment_ids(&self, candidates: &[String])
        -> Result<HashSet<String>, StorageError>;

    /// Upsert one batch of comments atomically: either every row lands or none does.
    async fn upsert_comment_batch(&self, rows: &[CommentRow]) -> Result<u64, StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    pub post_chunk_size: usize,
    pub comment_chunk_size: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            post_chunk_size: DEFAULT_POST_CHUNK_SIZE,
            comment_chunk_size: DEFAULT_COMMENT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub batches: usize,
    pub rows: usize,
    pub dangling_parents: usize,
    pub skipped: usize,
}

/// Output of parent resolution for one comment batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedBatch {
    pub rows: Vec<CommentRow>,
    pub dangling_parents: usize,
    pub skipped: usize,
}

struct PendingComment<'a> {
    source: &'a FlatComment,
    id: String,
    parent: Option<NormalizedId>,
    post_id: Option<String>,
}

impl PendingComment<'_> {
    fn parent_candidate(&self) -> Option<&str> {
        match &self.parent {
            Some(parent) if !parent.is_post() => Some(parent.id.as_str()),
            _ => None,
        }
    }
}

/// Normalize ids and collapse duplicate keys, keeping the last occurrence in place.
fn normalize_batch(batch: &[FlatComment]) -> (Vec<PendingComment<'_>>, usize) {
    let mut skipped = 0usize;
    let mut seen = HashSet::new();
    let mut pending = Vec::with_capacity(batch.len());

    for comment in batch.iter().rev() {
        let Some(id) = canonical_id(Some(&comment.id)) else {
            warn!(raw_id = %comment.id, "skipping comment without a usable id");
            skipped += 1;
            continue;
        };
        if !seen.insert(id.clone()) {
            debug!(%id, "dropping earlier duplicate of comment within batch");
            continue;
        }
        pending.push(PendingComment {
            source: comment,
            id,
            parent: normalize_id(comment.parent_ref.as_deref()),
            post_id: canonical_id(comment.link_ref.as_deref()),
        });
    }

    pending.reverse();
    (pending, skipped)
}

fn candidates_of(pending: &[PendingComment<'_>]) -> Vec<String> {
    pending
        .iter()
        .filter_map(PendingComment::parent_candidate)
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn resolve_pending(pending: &[PendingComment<'_>], existing: &HashSet<String>) -> (Vec<CommentRow>, usize) {
    let in_batch: HashSet<&str> = pending.iter().map(|p| p.id.as_str()).collect();
    let mut dangling = 0usize;

    let rows = pending
        .iter()
        .map(|p| {
            let parent_id = match p.parent_candidate() {
                Some(parent) if existing.contains(parent) || in_batch.contains(parent) => {
                    Some(parent.to_string())
                }
                Some(parent) => {
                    debug!(comment_id = %p.id, parent, "dropping dangling parent reference");
                    dangling += 1;
                    None
                }
                None => None,
            };
            CommentRow {
                id: p.id.clone(),
                body: p.source.body.clone(),
                author: p.source.author.as_stored().to_string(),
                created_utc: p.source.created_utc,
                parent_id,
                post_id: p.post_id.clone(),
                score: clamp_score(p.source.score),
            }
        })
        .collect();

    (rows, dangling)
}

/// Distinct normalized parent ids in `batch` that must be looked up in storage.
///
/// Post-type parents and missing parents never become candidates.
pub fn parent_candidates(batch: &[FlatComment]) -> Vec<String> {
    let (pending, _) = normalize_batch(batch);
    candidates_of(&pending)
}

/// Resolve every record's `parent_id` against `existing` (a pre-batch snapshot of
/// stored comment ids) unioned with the ids of the batch itself.
pub fn resolve_comment_batch(batch: &[FlatComment], existing: &HashSet<String>) -> ResolvedBatch {
    let (pending, skipped) = normalize_batch(batch);
    let (rows, dangling_parents) = resolve_pending(&pending, existing);
    ResolvedBatch {
        rows,
        dangling_parents,
        skipped,
    }
}

/// Splits record sets into batches and applies each as an idempotent upsert.
#[derive(Debug)]
pub struct UpsertEngine<S> {
    store: S,
    config: ChunkConfig,
}

impl<S: RecordStore> UpsertEngine<S> {
    pub fn new(store: S, config: ChunkConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> ChunkConfig {
        self.config
    }

    /// Batches run independently; a failing batch stops the call but earlier ones stay written.
    pub async fn upsert_posts(&self, posts: &[Post]) -> Result<UpsertReport, StorageError> {
        let mut report = UpsertReport::default();
        if posts.is_empty() {
            return Ok(report);
        }

        let chunk_size = self.config.post_chunk_size.max(1);
        for (batch_index, chunk) in posts.chunks(chunk_size).enumerate() {
            let mut seen = HashSet::new();
            let mut rows = Vec::with_capacity(chunk.len());
            for post in chunk.iter().rev() {
                match PostRow::from_post(post) {
                    Some(row) if seen.insert(row.id.clone()) => rows.push(row),
                    Some(_) => {}
                    None => {
                        warn!(raw_id = %post.id, "skipping post without a usable id");
                        report.skipped += 1;
                    }
                }
            }
            rows.reverse();
            if rows.is_empty() {
                continue;
            }

            self.store
                .upsert_post_batch(&rows)
                .instrument(info_span!("post_batch", batch_index, rows = rows.len()))
                .await
                .inspect_err(|err| warn!(batch_index, error = %err, "post batch upsert failed"))?;

            report.batches += 1;
            report.rows += rows.len();
        }

        Ok(report)
    }

    /// Per batch: look up parents, resolve links, then write the batch in one transaction.
    pub async fn upsert_comments(&self, comments: &[FlatComment]) -> Result<UpsertReport, StorageError> {
        let mut report = UpsertReport::default();
        if comments.is_empty() {
            return Ok(report);
        }

        let chunk_size = self.config.comment_chunk_size.max(1);
        for (batch_index, chunk) in comments.chunks(chunk_size).enumerate() {
            let (pending, skipped) = normalize_batch(chunk);
            report.skipped += skipped;
            if pending.is_empty() {
                continue;
            }

            let candidates = candidates_of(&pending);
            let existing = if candidates.is_empty() {
                HashSet::new()
            } else {
                match self.store.existing_comment_ids(&candidates).await {
                    Ok(found) => found,
                    Err(err) => {
                        warn!(
                            batch_index,
                            candidates = candidates.len(),
                            error = %err,
                            "parent lookup failed; treating all stored parents as missing"
                        );
                        HashSet::new()
                    }
                }
            };

            let (rows, dangling) = resolve_pending(&pending, &existing);

            self.store
                .upsert_comment_batch(&rows)
                .instrument(info_span!("comment_batch", batch_index, rows = rows.len(), dangling))
                .await
                .inspect_err(|err| warn!(batch_index, error = %err, "comment batch upsert failed"))?;

            report.batches += 1;
            report.rows += rows.len();
            report.dangling_parents += dangling;
        }

        Ok(report)
    }
}

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub connect_options: PgConnectOptions,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgStoreConfig {
    pub fn new(connect_options: PgConnectOptions) -> Self {
        Self {
            connect_options,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_url(database_url: &str) -> Result<Self, StorageError> {
        Ok(Self::new(database_url.parse::<PgConnectOptions>()?))
    }

    pub fn from_parts(host: &str, port: u16, username: &str, password: &str, database: &str) -> Self {
        Self::new(
            PgConnectOptions::new()
                .host(host)
                .port(port)
                .username(username)
                .password(password)
                .database(database),
        )
    }
}

/// PostgreSQL-backed [`RecordStore`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_with(config.connect_options.clone())
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn upsert_post_batch(&self, rows: &[PostRow]) -> Result<u64, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO posts (id, subreddit, title, body, author, created_utc, score) ",
        );
        qb.push_values(rows.iter(), |mut b, row| {
            b.push_bind(&row.id)
                .push_bind(&row.subreddit)
                .push_bind(&row.title)
                .push_bind(&row.body)
                .push_bind(&row.author)
                .push_bind(row.created_utc)
                .push_bind(row.score);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET subreddit = EXCLUDED.subreddit, title = EXCLUDED.title, \
             body = EXCLUDED.body, author = EXCLUDED.author, created_utc = EXCLUDED.created_utc, \
             score = EXCLUDED.score",
        );

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn existing_comment_ids(
        &self,
        candidates: &[String],
    ) -> Result<HashSet<String>, StorageError> {
        if candidates.is_empty() {
            return Ok(HashSet::new());
        }

        let found: Vec<String> =
            sqlx::query_scalar("SELECT id FROM comments WHERE id = ANY($1)")
                .bind(candidates)
                .fetch_all(&self.pool)
                .await?;
        Ok(found.into_iter().collect())
    }

    async fn upsert_comment_batch(&self, rows: &[CommentRow]) -> Result<u64, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO comments (id, body, author, created_utc, parent_id, post_id, score) ",
        );
        qb.push_values(rows.iter(), |mut b, row| {
            b.push_bind(&row.id)
                .push_bind(&row.body)
                .push_bind(&row.author)
                .push_bind(row.created_utc)
                .push_bind(&row.parent_id)
                .push_bind(&row.post_id)
                .push_bind(row.score);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET body = EXCLUDED.body, author = EXCLUDED.author, \
             created_utc = EXCLUDED.created_utc, parent_id = EXCLUDED.parent_id, \
             post_id = EXCLUDED.post_id, score = EXCLUDED.score",
        );

        let mut tx = self.pool.begin().await?;
        match qb.build().execute(&mut *tx).await {
            Ok(result) => {
                tx.commit().await?;
                Ok(result.rows_affected())
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback of comment batch failed");
                }
                Err(err.into())
            }
        }
    }
}

/// In-memory [`RecordStore`] enforcing the same primary and foreign key rules as the schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    posts: BTreeMap<String, PostRow>,
    comments: BTreeMap<String, CommentRow>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn post(&self, id: &str) -> Option<PostRow> {
        self.state.lock().await.posts.get(id).cloned()
    }

    pub async fn comment(&self, id: &str) -> Option<CommentRow> {
        self.state.lock().await.comments.get(id).cloned()
    }

    pub async fn post_count(&self) -> usize {
        self.state.lock().await.posts.len()
    }

    pub async fn comment_count(&self) -> usize {
        self.state.lock().await.comments.len()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert_post_batch(&self, rows: &[PostRow]) -> Result<u64, StorageError> {
        let mut state = self.state.lock().await;
        for row in rows {
            state.posts.insert(row.id.clone(), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn existing_comment_ids(
        &self,
        candidates: &[String],
    ) -> Result<HashSet<String>, StorageError> {
        let state = self.state.lock().await;
        Ok(candidates
            .iter()
            .filter(|id| state.comments.contains_key(id.as_str()))
            .cloned()
            .collect())
    }

    async fn upsert_comment_batch(&self, rows: &[CommentRow]) -> Result<u64, StorageError> {
        let mut state = self.state.lock().await;
        let batch_ids: HashSet<&str> = rows.iter().map(|r| r.id.as_str()).collect();

        for row in rows {
            if let Some(parent) = &row.parent_id {
                if !batch_ids.contains(parent.as_str()) && !state.comments.contains_key(parent) {
                    return Err(StorageError::Constraint(format!(
                        "comment {} references missing parent {}",
                        row.id, parent
                    )));
                }
            }
            if let Some(post) = &row.post_id {
                if !state.posts.contains_key(post) {
                    return Err(StorageError::Constraint(format!(
                        "comment {} references missing post {}",
                        row.id, post
                    )));
                }
            }
        }

        for row in rows {
            state.comments.insert(row.id.clone(), row.clone());
        }
        Ok(rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdc_core::Author;
    use std::sync::Mutex as StdMutex;

    fn post(id: &str, title: &str) -> Post {
        Post {
            id: id.to_string(),
            subreddit: "pennystocks".into(),
            title: title.to_string(),
            body: Some("body".into()),
            author: Author::Known("op".into()),
            created_utc: 1_700_000_000,
            score: 3,
        }
    }

    fn comment(id: &str, parent: Option<&str>, body: &str) -> FlatComment {
        FlatComment {
            id: id.to_string(),
            body: body.to_string(),
            author: Author::Known("commenter".into()),
            created_utc: 1_700_000_100,
            parent_ref: parent.map(str::to_string),
            link_ref: Some("t3_p1".to_string()),
            score: 1,
        }
    }

    /// Wraps a [`MemoryStore`], records batch sizes and fails on request.
    #[derive(Default)]
    struct ScriptedStore {
        inner: MemoryStore,
        fail_comment_batch: Option<usize>,
        fail_lookup: bool,
        post_batches: StdMutex<Vec<usize>>,
        comment_batches: StdMutex<Vec<usize>>,
    }

    #[async_trait]
    impl RecordStore for ScriptedStore {
        async fn upsert_post_batch(&self, rows: &[PostRow]) -> Result<u64, StorageError> {
            self.post_batches.lock().unwrap().push(rows.len());
            self.inner.upsert_post_batch(rows).await
        }

        async fn existing_comment_ids(
            &self,
            candidates: &[String],
        ) -> Result<HashSet<String>, StorageError> {
            if self.fail_lookup {
                return Err(StorageError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.existing_comment_ids(candidates).await
        }

        async fn upsert_comment_batch(&self, rows: &[CommentRow]) -> Result<u64, StorageError> {
            let index = {
                let mut batches = self.comment_batches.lock().unwrap();
                batches.push(rows.len());
                batches.len() - 1
            };
            if self.fail_comment_batch == Some(index) {
                return Err(StorageError::Database(sqlx::Error::PoolClosed));
            }
            self.inner.upsert_comment_batch(rows).await
        }
    }

    async fn seeded(store: ScriptedStore) -> UpsertEngine<ScriptedStore> {
        let engine = UpsertEngine::new(store, ChunkConfig::default());
        engine.upsert_posts(&[post("p1", "seed")]).await.expect("seed post");
        engine.store().post_batches.lock().unwrap().clear();
        engine
    }

    #[tokio::test]
    async fn posts_are_chunked_into_independent_batches() {
        let store = ScriptedStore::default();
        let engine = UpsertEngine::new(
            store,
            ChunkConfig {
                post_chunk_size: 50,
                comment_chunk_size: 200,
            },
        );
        let posts: Vec<_> = (0..101).map(|i| post(&format!("p{i}"), "title")).collect();

        let report = engine.upsert_posts(&posts).await.expect("upsert");

        assert_eq!(report.batches, 3);
        assert_eq!(report.rows, 101);
        assert_eq!(*engine.store().post_batches.lock().unwrap(), vec![50, 50, 1]);
        assert_eq!(engine.store().inner.post_count().await, 101);
    }

    #[tokio::test]
    async fn comments_are_chunked_by_configured_size() {
        let mut engine = seeded(ScriptedStore::default()).await;
        engine.config.comment_chunk_size = 50;
        let comments: Vec<_> = (0..101)
            .map(|i| comment(&format!("c{i}"), Some("t3_p1"), "hi"))
            .collect();

        let report = engine.upsert_comments(&comments).await.expect("upsert");

        assert_eq!(report.batches, 3);
        assert_eq!(*engine.store().comment_batches.lock().unwrap(), vec![50, 50, 1]);
    }

    #[tokio::test]
    async fn repeated_upserts_keep_one_row_with_latest_values() {
        let engine = seeded(ScriptedStore::default()).await;

        engine.upsert_posts(&[post("p1", "first")]).await.expect("first");
        engine.upsert_posts(&[post("p1", "second")]).await.expect("second");
        engine
            .upsert_comments(&[comment("t1_c1", Some("t3_p1"), "old")])
            .await
            .expect("first comment");
        engine
            .upsert_comments(&[comment("t1_c1", Some("t3_p1"), "new")])
            .await
            .expect("second comment");

        let store = &engine.store().inner;
        assert_eq!(store.post_count().await, 1);
        assert_eq!(store.post("p1").await.map(|p| p.title), Some("second".into()));
        assert_eq!(store.comment_count().await, 1);
        assert_eq!(store.comment("c1").await.map(|c| c.body), Some("new".into()));
    }

    #[tokio::test]
    async fn dangling_parents_are_nulled_not_rejected() {
        let engine = seeded(ScriptedStore::default()).await;

        let report = engine
            .upsert_comments(&[comment("t1_orphan", Some("t1_ghost"), "where is my parent")])
            .await
            .expect("dangling parent must not fail the write");

        assert_eq!(report.dangling_parents, 1);
        let row = engine.store().inner.comment("orphan").await.expect("row persisted");
        assert_eq!(row.parent_id, None);
        assert_eq!(row.post_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn parents_in_the_same_batch_are_kept_in_either_order() {
        let engine = seeded(ScriptedStore::default()).await;

        engine
            .upsert_comments(&[
                comment("t1_child", Some("t1_parent"), "reply"),
                comment("t1_parent", Some("t3_p1"), "top"),
            ])
            .await
            .expect("upsert");

        let child = engine.store().inner.comment("child").await.expect("child");
        assert_eq!(child.parent_id.as_deref(), Some("parent"));
        let parent = engine.store().inner.comment("parent").await.expect("parent");
        assert_eq!(parent.parent_id, None);
    }

    #[tokio::test]
    async fn parents_from_earlier_batches_are_found_in_storage() {
        let mut engine = seeded(ScriptedStore::default()).await;
        engine.config.comment_chunk_size = 1;

        let report = engine
            .upsert_comments(&[
                comment("t1_a", Some("t3_p1"), "top"),
                comment("t1_b", Some("t1_a"), "reply"),
            ])
            .await
            .expect("upsert");

        assert_eq!(report.batches, 2);
        assert_eq!(report.dangling_parents, 0);
        let b = engine.store().inner.comment("b").await.expect("b");
        assert_eq!(b.parent_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn lookup_failure_degrades_to_null_parents() {
        let failing = ScriptedStore {
            inner: MemoryStore::new(),
            fail_lookup: true,
            ..Default::default()
        };
        let failing = seeded(failing).await;
        failing
            .store()
            .inner
            .upsert_comment_batch(&[CommentRow {
                id: "a".into(),
                body: "top".into(),
                author: "x".into(),
                created_utc: 0,
                parent_id: None,
                post_id: Some("p1".into()),
                score: 0,
            }])
            .await
            .expect("seed stored parent");

        let report = failing
            .upsert_comments(&[
                comment("t1_b", Some("t1_a"), "reply to stored"),
                comment("t1_c", Some("t1_b"), "reply in batch"),
            ])
            .await
            .expect("lookup failure is not fatal");

        assert_eq!(report.dangling_parents, 1);
        let b = failing.store().inner.comment("b").await.expect("b");
        assert_eq!(b.parent_id, None);
        let c = failing.store().inner.comment("c").await.expect("c");
        assert_eq!(c.parent_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn failed_batch_stops_the_call_but_keeps_earlier_batches() {
        let store = ScriptedStore {
            fail_comment_batch: Some(1),
            ..Default::default()
        };
        let mut engine = seeded(store).await;
        engine.config.comment_chunk_size = 2;
        let comments: Vec<_> = (0..6)
            .map(|i| comment(&format!("t1_c{i}"), Some("t3_p1"), "hi"))
            .collect();

        let err = engine.upsert_comments(&comments).await.expect_err("second batch fails");
        assert!(matches!(err, StorageError::Database(_)));

        let store = &engine.store().inner;
        assert!(store.comment("c0").await.is_some());
        assert!(store.comment("c1").await.is_some());
        assert!(store.comment("c2").await.is_none());
        assert!(store.comment("c4").await.is_none());
        assert_eq!(engine.store().comment_batches.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_input_is_a_no_op() {
        let engine = UpsertEngine::new(ScriptedStore::default(), ChunkConfig::default());
        assert_eq!(engine.upsert_posts(&[]).await.expect("posts"), UpsertReport::default());
        assert_eq!(engine.upsert_comments(&[]).await.expect("comments"), UpsertReport::default());
        assert!(engine.store().post_batches.lock().unwrap().is_empty());
        assert!(engine.store().comment_batches.lock().unwrap().is_empty());
    }

    #[test]
    fn post_type_parents_force_top_level() {
        let batch = vec![
            comment("t1_p1", Some("t3_p1"), "a comment that shares the post id"),
            comment("t1_x", Some("t3_p1"), "top level"),
        ];
        let resolved = resolve_comment_batch(&batch, &HashSet::new());
        assert!(resolved.rows.iter().all(|r| r.parent_id.is_none()));
        assert_eq!(resolved.dangling_parents, 0);
        assert!(parent_candidates(&batch).is_empty());
    }

    #[test]
    fn candidates_are_distinct_and_bare() {
        let batch = vec![
            comment("t1_a", Some("t1_root"), "x"),
            comment("t1_b", Some("t1_root"), "y"),
            comment("t1_c", Some("legacy"), "z"),
            comment("t1_d", None, "w"),
        ];
        assert_eq!(parent_candidates(&batch), vec!["legacy".to_string(), "root".to_string()]);
    }

    #[test]
    fn duplicate_ids_keep_the_last_record() {
        let batch = vec![
            comment("t1_a", Some("t3_p1"), "first"),
            comment("t1_b", Some("t3_p1"), "other"),
            comment("a", Some("t3_p1"), "second"),
        ];
        let resolved = resolve_comment_batch(&batch, &HashSet::new());
        assert_eq!(resolved.rows.len(), 2);
        assert_eq!(resolved.rows[0].id, "b");
        assert_eq!(resolved.rows[1].body, "second");
    }

    #[test]
    fn unkeyable_records_are_skipped() {
        let batch = vec![comment("", Some("t3_p1"), "no id"), comment("t1_ok", None, "fine")];
        let resolved = resolve_comment_batch(&batch, &HashSet::new());
        assert_eq!(resolved.skipped, 1);
        assert_eq!(resolved.rows.len(), 1);
        assert_eq!(resolved.rows[0].post_id.as_deref(), Some("p1"));
    }

    #[test]
    fn scores_saturate_into_integer_column() {
        assert_eq!(clamp_score(i64::MAX), i32::MAX);
        assert_eq!(clamp_score(i64::MIN), i32::MIN);
        assert_eq!(clamp_score(-7), -7);
    }

    #[tokio::test]
    async fn memory_store_rejects_real_foreign_key_violations() {
        let store = MemoryStore::new();
        let err = store
            .upsert_comment_batch(&[CommentRow {
                id: "a".into(),
                body: "b".into(),
                author: "[deleted]".into(),
                created_utc: 0,
                parent_id: Some("ghost".into()),
                post_id: None,
                score: 0,
            }])
            .await
            .expect_err("missing parent");
        assert!(matches!(err, StorageError::Constraint(_)));
        assert_eq!(store.comment_count().await, 0);
    }
}
