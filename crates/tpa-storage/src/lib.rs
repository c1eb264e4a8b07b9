//! HTTP fetch utilities, the wait-time snapshot store and the relational read-model.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tpa_core::{
    KnownAttraction, NewAttraction, NewPark, Park, SubscribedPark, Subscription, WaittimeRecord,
};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 4,
            token_bucket: None,
        }
    }
}

/// Upstream request budget: up to `capacity` requests at once, one more earned every
/// `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// `None` unless both limits are positive; a zero in either disables pacing.
    pub fn from_limits(capacity: u32, refill_every: Duration) -> Option<Self> {
        (capacity > 0 && !refill_every.is_zero()).then_some(Self {
            capacity,
            refill_every,
        })
    }
}

/// Paces upstream GETs so one invocation cannot exceed the upstream rate limit.
#[derive(Debug)]
pub struct RateLimiter {
    config: TokenBucketConfig,
    budget: Mutex<Budget>,
}

#[derive(Debug)]
struct Budget {
    available: u32,
    refilled_at: Instant,
}

impl Budget {
    fn refill(&mut self, config: TokenBucketConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled_at);
        let period = config.refill_every.as_nanos().max(1);
        let earned = elapsed.as_nanos() / period;
        if earned == 0 {
            return;
        }
        let carry = Duration::from_nanos((elapsed.as_nanos() % period) as u64);
        self.refilled_at = now - carry;
        self.available = (u128::from(self.available) + earned).min(u128::from(config.capacity)) as u32;
    }
}

impl RateLimiter {
    pub fn new(config: TokenBucketConfig) -> Self {
        let config = TokenBucketConfig {
            capacity: config.capacity.max(1),
            ..config
        };
        Self {
            config,
            budget: Mutex::new(Budget {
                available: config.capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Wait until one more request fits the budget, then spend it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut budget = self.budget.lock().await;
                let now = Instant::now();
                budget.refill(self.config, now);
                if budget.available > 0 {
                    budget.available -= 1;
                    return;
                }
                (budget.refilled_at + self.config.refill_every)
                    .saturating_duration_since(now)
                    .max(Duration::from_millis(1))
            };
            debug!(wait_ms = wait.as_millis() as u64, "upstream budget spent");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Shared reqwest client with global and per-host concurrency limits.
///
/// A single attempt is made per call; failures surface to the caller, which decides
/// whether the next scheduled run is the retry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    rate_limit: Option<RateLimiter>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let rate_limit = config.token_bucket.map(RateLimiter::new);

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            rate_limit,
        })
    }

    async fn per_host_semaphore(&self, url: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host_key(url))
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    /// GET `url` and decode a JSON body. Rate limited by the token bucket when configured.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_host = self.per_host_semaphore(url).await;
        let _host = per_host.acquire().await.expect("semaphore not closed");

        if let Some(limiter) = &self.rate_limit {
            limiter.acquire().await;
        }

        self.send_get(url, headers)
            .instrument(info_span!("http_get", url))
            .await
    }

    async fn send_get<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let mut header_map = HeaderMap::new();
        header_map.insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (name, value) in headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                header_map.insert(name, value);
            }
        }

        let resp = self.client.get(url).headers(header_map).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: final_url,
            source,
        })
    }

    /// POST a raw body. Any non-2xx status is an error.
    pub async fn post(
        &self,
        url: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<StatusCode, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_host = self.per_host_semaphore(url).await;
        let _host = per_host.acquire().await.expect("semaphore not closed");

        let resp = self
            .client
            .post(url)
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .instrument(info_span!("http_post", url))
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        debug!(url, %status, "post delivered");
        Ok(status)
    }
}

fn host_key(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_else(|| "<invalid-host>".to_string())
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cached snapshot for `{key}` is not valid JSON: {source}")]
    Parse {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding snapshot for `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SnapshotError {
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }
}

/// Key/value store of the last observed wait-time list per park.
///
/// `get` distinguishes a missing key (`None`) from a stored empty list.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<WaittimeRecord>>, SnapshotError>;

    /// Replace the stored list for `key` wholesale.
    async fn put(&self, key: &str, records: &[WaittimeRecord]) -> Result<(), SnapshotError>;
}

fn decode_snapshot(key: &str, raw: &[u8]) -> Result<Option<Vec<WaittimeRecord>>, SnapshotError> {
    if raw.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(raw)
        .map(Some)
        .map_err(|source| SnapshotError::Parse {
            key: key.to_string(),
            source,
        })
}

fn encode_snapshot(key: &str, records: &[WaittimeRecord]) -> Result<Vec<u8>, SnapshotError> {
    serde_json::to_vec(records).map_err(|source| SnapshotError::Encode {
        key: key.to_string(),
        source,
    })
}

/// One JSON file per key under `root`, replaced via temp-file + rename.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let safe = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect::<String>();
        self.root.join(format!("{safe}.json"))
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| SnapshotError::Io { path, source }
        };

        fs::create_dir_all(&self.root)
            .await
            .map_err(io_err(&self.root))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        file.write_all(bytes).await.map_err(io_err(&temp_path))?;
        file.flush().await.map_err(io_err(&temp_path))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(SnapshotError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<WaittimeRecord>>, SnapshotError> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(raw) => decode_snapshot(key, &raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SnapshotError::Io { path, source }),
        }
    }

    async fn put(&self, key: &str, records: &[WaittimeRecord]) -> Result<(), SnapshotError> {
        let bytes = encode_snapshot(key, records)?;
        self.write_atomic(&self.path_for(key), &bytes).await
    }
}

/// In-process store holding raw JSON, so corrupt entries behave like the file store.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_raw(&self, key: &str, raw: impl Into<Vec<u8>>) {
        self.entries.lock().await.insert(key.to_string(), raw.into());
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<WaittimeRecord>>, SnapshotError> {
        match self.entries.lock().await.get(key) {
            Some(raw) => decode_snapshot(key, raw),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, records: &[WaittimeRecord]) -> Result<(), SnapshotError> {
        let bytes = encode_snapshot(key, records)?;
        self.entries.lock().await.insert(key.to_string(), bytes);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

/// Read/insert surface of the relational store used by the background jobs.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Parks with at least one active attraction subscription.
    async fn list_subscribed_parks(&self) -> Result<Vec<SubscribedPark>, CatalogError>;

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, CatalogError>;

    /// All parks, in a stable order; batch windows slice this list.
    async fn list_parks(&self) -> Result<Vec<Park>, CatalogError>;

    async fn list_known_attractions(
        &self,
        park_api_codes: &[String],
    ) -> Result<Vec<KnownAttraction>, CatalogError>;

    async fn insert_attractions(&self, batch: &[NewAttraction]) -> Result<(), CatalogError>;

    async fn insert_parks(&self, batch: &[NewPark]) -> Result<(), CatalogError>;
}

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }
}

// Ids are serial (int4) columns; widen them so they decode into i64.
const LIST_SUBSCRIPTIONS_SQL: &str = r#"
    SELECT user_id::int8 AS user_id,
           attraction_api_code,
           themepark_api_name,
           webhook_url,
           notification_provider_name
      FROM attraction_subscriptions
"#;

const LIST_PARKS_SQL: &str = r#"
    SELECT id::int8 AS id, api_name
      FROM themepark
     ORDER BY id
"#;

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn list_subscribed_parks(&self) -> Result<Vec<SubscribedPark>, CatalogError> {
        let rows = sqlx::query(
            r#"
            SELECT api_name
              FROM subscribed_themeparks
             ORDER BY api_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SubscribedPark {
                api_code: row.try_get("api_name")?,
            });
        }
        Ok(out)
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, CatalogError> {
        let rows = sqlx::query(LIST_SUBSCRIPTIONS_SQL)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Subscription {
                user_id: row.try_get("user_id")?,
                attraction_api_code: row.try_get("attraction_api_code")?,
                themepark_api_name: row.try_get("themepark_api_name")?,
                webhook_url: row.try_get("webhook_url")?,
                notification_provider_name: row.try_get("notification_provider_name")?,
            });
        }
        Ok(out)
    }

    async fn list_parks(&self) -> Result<Vec<Park>, CatalogError> {
        let rows = sqlx::query(LIST_PARKS_SQL)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Park {
                id: row.try_get("id")?,
                api_code: row.try_get("api_name")?,
            });
        }
        Ok(out)
    }

    async fn list_known_attractions(
        &self,
        park_api_codes: &[String],
    ) -> Result<Vec<KnownAttraction>, CatalogError> {
        if park_api_codes.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT a.api_code, t.api_name
              FROM attraction a
              JOIN themepark t ON t.id = a.themepark_id
             WHERE t.api_name = ANY($1)
            "#,
        )
        .bind(park_api_codes)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(KnownAttraction {
                code: row.try_get("api_code")?,
                park_api_code: row.try_get("api_name")?,
            });
        }
        Ok(out)
    }

    async fn insert_attractions(&self, batch: &[NewAttraction]) -> Result<(), CatalogError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO attraction (name, api_code, themepark_id) ");
        qb.push_values(batch, |mut row, item| {
            row.push_bind(item.name.clone())
                .push_bind(item.code.clone())
                .push("(SELECT id FROM themepark WHERE api_name = ")
                .push_bind_unseparated(item.park_api_code.clone())
                .push_unseparated(")");
        });
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_parks(&self, batch: &[NewPark]) -> Result<(), CatalogError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO themepark (name, countrycode, api_name) ");
        qb.push_values(batch, |mut row, item| {
            row.push_bind(item.name.clone())
                .push_bind(item.country_code.clone())
                .push_bind(item.api_code.clone());
        });
        qb.build().execute(&self.pool).await?;
        Ok(())
    }
}

/// In-process catalog for tests and dry runs. Inserts are recorded per call so callers can
/// assert on sub-batch sizes.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    pub subscribed_parks: Vec<SubscribedPark>,
    pub subscriptions: Vec<Subscription>,
    pub parks: Vec<Park>,
    pub known_attractions: Vec<KnownAttraction>,
    pub failing_insert_parks: HashSet<String>,
    pub fail_listing: bool,
    attraction_batches: Mutex<Vec<Vec<NewAttraction>>>,
    park_batches: Mutex<Vec<Vec<NewPark>>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attraction_batches(&self) -> Vec<Vec<NewAttraction>> {
        self.attraction_batches.lock().await.clone()
    }

    pub async fn park_batches(&self) -> Vec<Vec<NewPark>> {
        self.park_batches.lock().await.clone()
    }

    fn check_listing(&self) -> Result<(), CatalogError> {
        if self.fail_listing {
            return Err(CatalogError::Message("listing disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn list_subscribed_parks(&self) -> Result<Vec<SubscribedPark>, CatalogError> {
        self.check_listing()?;
        Ok(self.subscribed_parks.clone())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, CatalogError> {
        self.check_listing()?;
        Ok(self.subscriptions.clone())
    }

    async fn list_parks(&self) -> Result<Vec<Park>, CatalogError> {
        self.check_listing()?;
        Ok(self.parks.clone())
    }

    async fn list_known_attractions(
        &self,
        park_api_codes: &[String],
    ) -> Result<Vec<KnownAttraction>, CatalogError> {
        self.check_listing()?;
        Ok(self
            .known_attractions
            .iter()
            .filter(|a| park_api_codes.contains(&a.park_api_code))
            .cloned()
            .collect())
    }

    async fn insert_attractions(&self, batch: &[NewAttraction]) -> Result<(), CatalogError> {
        if let Some(bad) = batch
            .iter()
            .find(|a| self.failing_insert_parks.contains(&a.park_api_code))
        {
            return Err(CatalogError::Message(format!(
                "insert rejected for park {}",
                bad.park_api_code
            )));
        }
        self.attraction_batches.lock().await.push(batch.to_vec());
        Ok(())
    }

    async fn insert_parks(&self, batch: &[NewPark]) -> Result<(), CatalogError> {
        self.park_batches.lock().await.push(batch.to_vec());
        Ok(())
    }
}
