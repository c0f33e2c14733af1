//! Content source contract, Reddit OAuth client, and the rate-limited reply fetcher.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rdc_core::{canonical_id, Author, CommentNode, Post};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "rdc-adapters";

pub const REDDIT_AUTH_URL: &str = "https://www.reddit.com/api/v1/access_token";
pub const REDDIT_API_BASE: &str = "https://oauth.reddit.com";

/// Largest page the listing endpoints hand out.
const LISTING_PAGE_MAX: usize = 100;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("throttled by upstream (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected payload: {0}")]
    Decode(String),
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl SourceError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, SourceError::Throttled { .. })
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::Decode(err.to_string())
    }
}

/// Remote discussion platform, as seen by the collector.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Most recent posts of `forum`, in listing order, at most `limit`.
    async fn list_posts(&self, forum: &str, limit: usize) -> Result<Vec<Post>, SourceError>;

    async fn fetch_post(&self, post_id: &str) -> Result<Post, SourceError>;

    /// Reply tree of a post, expanded to `depth` levels and `breadth` comments per request.
    async fn expand_replies(
        &self,
        post_id: &str,
        depth: u32,
        breadth: u32,
    ) -> Result<Vec<CommentNode>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingSort {
    #[default]
    New,
    Hot,
}

impl ListingSort {
    pub fn as_path(self) -> &'static str {
        match self {
            ListingSort::New => "new",
            ListingSort::Hot => "hot",
        }
    }
}

impl FromStr for ListingSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(ListingSort::New),
            "hot" => Ok(ListingSort::Hot),
            other => Err(format!("unknown listing sort {other:?}; expected new or hot")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Delay before the next attempt. An upstream hint is a floor and is never shortened.
    pub fn delay_after_throttle(&self, attempt_index: usize, retry_after: Option<Duration>) -> Duration {
        let computed = self.delay_for_attempt(attempt_index);
        match retry_after {
            Some(hint) => computed.max(hint),
            None => computed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            refill_every: Duration::from_secs(1),
        }
    }
}

/// Client-side request pacing shared by every call a [`RedditClient`] makes.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            capacity,
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait for a token. A zero `refill_every` disables pacing.
    pub async fn take(&self) {
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(state.last_refill);
            if elapsed >= self.refill_every {
                let every = self.refill_every.as_nanos();
                let refills = u32::try_from(elapsed.as_nanos() / every).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                // Carry the partial interval forward.
                let carried = Duration::from_nanos((elapsed.as_nanos() % every) as u64);
                state.last_refill = now - carried;
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self
                .refill_every
                .saturating_sub(now.saturating_duration_since(state.last_refill));
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Clone)]
pub struct RedditConfig {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub listing_sort: ListingSort,
    pub auth_url: String,
    pub api_base: String,
    pub token_bucket: TokenBucketConfig,
}

impl RedditConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            username: username.into(),
            password: password.into(),
            user_agent: user_agent.into(),
            timeout: Duration::from_secs(20),
            listing_sort: ListingSort::default(),
            auth_url: REDDIT_AUTH_URL.to_string(),
            api_base: REDDIT_API_BASE.to_string(),
            token_bucket: TokenBucketConfig::default(),
        }
    }
}

impl std::fmt::Debug for RedditConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedditConfig")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("user_agent", &self.user_agent)
            .field("timeout", &self.timeout)
            .field("listing_sort", &self.listing_sort)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

/// Reddit OAuth ("script" app, password grant) implementation of [`ContentSource`].
#[derive(Debug)]
pub struct RedditClient {
    client: reqwest::Client,
    config: RedditConfig,
    token: Mutex<Option<AccessToken>>,
    bucket: TokenBucket,
}

impl RedditClient {
    pub fn new(config: RedditConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        let bucket = TokenBucket::new(config.token_bucket);
        Ok(Self {
            client,
            config,
            token: Mutex::new(None),
            bucket,
        })
    }

    pub fn config(&self) -> &RedditConfig {
        &self.config
    }

    async fn access_token(&self) -> Result<String, SourceError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        self.bucket.take().await;
        let resp = self
            .client
            .post(&self.config.auth_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[
                ("grant_type", "password"),
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::Throttled {
                retry_after: retry_after_from_headers(resp.headers()),
            });
        }
        if !status.is_success() {
            return Err(SourceError::Auth(format!("token endpoint returned {status}")));
        }

        let body: TokenResponse = resp.json().await?;
        let value = body.access_token.ok_or_else(|| {
            SourceError::Auth(body.error.unwrap_or_else(|| "no access_token in response".into()))
        })?;
        // Refresh a minute early so in-flight requests never carry an expired token.
        let lifetime = Duration::from_secs(body.expires_in.unwrap_or(3600).saturating_sub(60));
        debug!(expires_in_secs = lifetime.as_secs(), "acquired reddit access token");

        *cached = Some(AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(value)
    }

    async fn get_bytes(&self, url: &str, query: &[(&str, String)]) -> Result<Vec<u8>, SourceError> {
        let token = self.access_token().await?;
        self.bucket.take().await;

        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::Throttled {
                retry_after: retry_after_from_headers(resp.headers()),
            });
        }
        if status == StatusCode::UNAUTHORIZED {
            self.token.lock().await.take();
            return Err(SourceError::Auth(format!("{url} rejected the access token")));
        }
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        Ok(resp.bytes().await?.to_vec())
    }

    async fn fetch_thread(
        &self,
        post_id: &str,
        depth: u32,
        breadth: u32,
    ) -> Result<(Post, Vec<CommentNode>), SourceError> {
        let id = canonical_id(Some(post_id))
            .ok_or_else(|| SourceError::Decode(format!("invalid post id {post_id:?}")))?;
        let url = format!("{}/comments/{}", self.config.api_base, id);
        let bytes = self
            .get_bytes(
                &url,
                &[
                    ("depth", depth.to_string()),
                    ("limit", breadth.to_string()),
                    ("raw_json", "1".to_string()),
                ],
            )
            .await?;
        parse_thread(&bytes)
    }
}

#[async_trait]
impl ContentSource for RedditClient {
    async fn list_posts(&self, forum: &str, limit: usize) -> Result<Vec<Post>, SourceError> {
        let forum = forum.trim().trim_start_matches("r/");
        let url = format!(
            "{}/r/{}/{}",
            self.config.api_base,
            forum,
            self.config.listing_sort.as_path()
        );

        let mut posts = Vec::with_capacity(limit);
        let mut after: Option<String> = None;
        while posts.len() < limit {
            let page_size = (limit - posts.len()).min(LISTING_PAGE_MAX);
            let mut query = vec![("limit", page_size.to_string()), ("raw_json", "1".to_string())];
            if let Some(cursor) = &after {
                query.push(("after", cursor.clone()));
            }

            let bytes = self.get_bytes(&url, &query).await?;
            let page = parse_post_listing(&bytes)?;
            let fetched = page.posts.len();
            posts.extend(page.posts);
            debug!(forum, fetched, total = posts.len(), "fetched listing page");

            match page.after {
                Some(cursor) if fetched > 0 => after = Some(cursor),
                _ => break,
            }
        }

        posts.truncate(limit);
        Ok(posts)
    }

    async fn fetch_post(&self, post_id: &str) -> Result<Post, SourceError> {
        let (post, _) = self.fetch_thread(post_id, 1, 1).await?;
        Ok(post)
    }

    async fn expand_replies(
        &self,
        post_id: &str,
        depth: u32,
        breadth: u32,
    ) -> Result<Vec<CommentNode>, SourceError> {
        let (_, replies) = self.fetch_thread(post_id, depth, breadth).await?;
        Ok(replies)
    }
}

/// `Retry-After` (seconds) or, failing that, Reddit's `x-ratelimit-reset`.
pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    let seconds = |name: &str| -> Option<f64> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
    };
    seconds(RETRY_AFTER.as_str())
        .or_else(|| seconds("x-ratelimit-reset"))
        .map(Duration::from_secs_f64)
}

#[derive(Debug, Deserialize)]
struct Thing {
    kind: String,
    #[serde(default)]
    data: JsonValue,
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Thing>,
    #[serde(default)]
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LinkData {
    id: String,
    #[serde(default)]
    subreddit: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    selftext: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    created_utc: f64,
    #[serde(default)]
    score: i64,
}

impl From<LinkData> for Post {
    fn from(link: LinkData) -> Self {
        Post {
            id: link.id,
            subreddit: link.subreddit,
            title: link.title,
            body: link.selftext.filter(|s| !s.is_empty()),
            author: Author::from_name(link.author.as_deref()),
            created_utc: link.created_utc as i64,
            score: link.score,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommentData {
    id: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    created_utc: f64,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    link_id: Option<String>,
    #[serde(default)]
    score: i64,
    /// Either an empty string or a nested listing.
    #[serde(default)]
    replies: JsonValue,
}

/// One page of a post listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostPage {
    pub posts: Vec<Post>,
    pub after: Option<String>,
}

pub fn parse_post_listing(bytes: &[u8]) -> Result<PostPage, SourceError> {
    let listing: Listing = serde_json::from_slice(bytes)?;
    let mut posts = Vec::with_capacity(listing.data.children.len());
    for child in listing.data.children {
        if child.kind == "t3" {
            let link: LinkData = serde_json::from_value(child.data)?;
            posts.push(link.into());
        }
    }
    Ok(PostPage {
        posts,
        after: listing.data.after,
    })
}

/// Decode a `/comments/{id}` response: `[post listing, comment listing]`.
pub fn parse_thread(bytes: &[u8]) -> Result<(Post, Vec<CommentNode>), SourceError> {
    let (post_listing, comment_listing): (Listing, Listing) = serde_json::from_slice(bytes)?;

    let link = post_listing
        .data
        .children
        .into_iter()
        .find(|t| t.kind == "t3")
        .ok_or_else(|| SourceError::Decode("thread response has no post".into()))?;
    let post: Post = serde_json::from_value::<LinkData>(link.data)?.into();

    let replies = comment_nodes(comment_listing)?;
    Ok((post, replies))
}

// Nesting is bounded by serde_json's recursion limit, so plain recursion is fine here.
fn comment_nodes(listing: Listing) -> Result<Vec<CommentNode>, SourceError> {
    let mut nodes = Vec::with_capacity(listing.data.children.len());
    for child in listing.data.children {
        match child.kind.as_str() {
            "t1" => {
                let data: CommentData = serde_json::from_value(child.data)?;
                let replies = match data.replies {
                    JsonValue::Object(_) => comment_nodes(serde_json::from_value(data.replies)?)?,
                    _ => Vec::new(),
                };
                nodes.push(CommentNode {
                    id: data.id,
                    body: data.body,
                    author: Author::from_name(data.author.as_deref()),
                    created_utc: data.created_utc as i64,
                    parent_ref: data.parent_id,
                    link_ref: data.link_id,
                    score: data.score,
                    replies,
                });
            }
            "more" => debug!("skipping unexpanded replies placeholder"),
            other => debug!(kind = other, "skipping unexpected thing in comment listing"),
        }
    }
    Ok(nodes)
}

#[derive(Debug, Clone, Copy)]
pub struct FetchConfig {
    pub backoff: BackoffPolicy,
    pub reply_depth: u32,
    pub reply_breadth: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            reply_depth: 10,
            reply_breadth: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Complete,
    Throttled,
    Failed,
}

/// Result of one post's reply fetch. Never an error: failures degrade to no replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentFetch {
    pub replies: Vec<CommentNode>,
    pub attempts: usize,
    pub status: FetchStatus,
}

/// Wraps a [`ContentSource`] with bounded exponential backoff on throttling.
#[derive(Debug)]
pub struct RateLimitedFetcher<S> {
    source: S,
    config: FetchConfig,
}

impl<S: ContentSource> RateLimitedFetcher<S> {
    pub fn new(source: S, config: FetchConfig) -> Self {
        Self { source, config }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn config(&self) -> FetchConfig {
        self.config
    }

    /// Runs `op` until it succeeds, fails without throttling, or the attempt ceiling is hit.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> (Result<T, SourceError>, usize)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let backoff = self.config.backoff;
        let max_attempts = backoff.max_attempts.max(1);
        let mut attempt = 0usize;

        loop {
            let result = op().await;
            attempt += 1;

            if attempt >= max_attempts {
                return (result, attempt);
            }
            let retry_after = match result {
                Err(SourceError::Throttled { retry_after }) => retry_after,
                other => return (other, attempt),
            };

            let delay = backoff.delay_after_throttle(attempt - 1, retry_after);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "throttled by upstream; backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn list_posts(&self, forum: &str, limit: usize) -> Result<Vec<Post>, SourceError> {
        let (result, _) = self.with_retry(|| self.source.list_posts(forum, limit)).await;
        result
    }

    pub async fn fetch_post(&self, post_id: &str) -> Result<Post, SourceError> {
        let (result, _) = self.with_retry(|| self.source.fetch_post(post_id)).await;
        result
    }

    pub async fn fetch_comments(&self, post_id: &str) -> CommentFetch {
        let depth = self.config.reply_depth;
        let breadth = self.config.reply_breadth;

        async {
            let (result, attempts) = self
                .with_retry(|| self.source.expand_replies(post_id, depth, breadth))
                .await;

            match result {
                Ok(replies) => CommentFetch {
                    replies,
                    attempts,
                    status: FetchStatus::Complete,
                },
                Err(err) if err.is_throttled() => {
                    warn!(attempts, "retry ceiling reached; continuing without comments");
                    CommentFetch {
                        replies: Vec::new(),
                        attempts,
                        status: FetchStatus::Throttled,
                    }
                }
                Err(err) => {
                    warn!(attempts, error = %err, "comment fetch failed; continuing without comments");
                    CommentFetch {
                        replies: Vec::new(),
                        attempts,
                        status: FetchStatus::Failed,
                    }
                }
            }
        }
        .instrument(info_span!("fetch_comments", post_id))
        .await
    }
}
