use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use hashbrown::HashMap;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("injected failure on call {0}")]
    Injected(usize),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The narrow slice of a ranked-set store the load generator talks to.
///
/// Implementations are shared by every write task and the sampler, so they
/// must be cheap to clone and safe to call concurrently.
#[async_trait]
pub trait ScoreStore: Clone + Send + Sync + 'static {
    /// Adds `delta` to the member's score, inserting the member if missing.
    /// Returns the new score.
    async fn increment_score(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64>;

    /// Sets the member's score. Returns `true` when the member was added and
    /// `false` when an existing member was updated.
    async fn set_score(&self, key: &str, member: &str, score: f64) -> StoreResult<bool>;

    /// Up to `n` members ordered by descending score.
    async fn top_n(&self, key: &str, n: usize) -> StoreResult<Vec<String>>;

    async fn count_all(&self, key: &str) -> StoreResult<u64>;
}

#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(host: &str, port: u16) -> anyhow::Result<Self> {
        let url = format!("redis://{}:{}/", host, port);
        let client = redis::Client::open(url.as_str())
            .with_context(|| format!("Invalid redis address {}", url))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| format!("Error connecting to {}", url))?;
        tracing::debug!("Connected to redis at {}", url);
        Ok(Self { connection })
    }
}

#[async_trait]
impl ScoreStore for RedisStore {
    async fn increment_score(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64> {
        // The multiplexed connection is a cheap handle onto one socket.
        let mut con = self.connection.clone();
        Ok(con.zincr(key, member, delta).await?)
    }

    async fn set_score(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        let mut con = self.connection.clone();
        let added: usize = con.zadd(key, member, score).await?;
        Ok(added > 0)
    }

    async fn top_n(&self, key: &str, n: usize) -> StoreResult<Vec<String>> {
        // A stop index of -1 would mean "everything".
        if n == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(n).unwrap_or(isize::MAX) - 1;
        let mut con = self.connection.clone();
        Ok(con.zrevrange(key, 0, stop).await?)
    }

    async fn count_all(&self, key: &str) -> StoreResult<u64> {
        let mut con = self.connection.clone();
        Ok(con.zcount(key, "-inf", "+inf").await?)
    }
}

/// In-process ranked set, used for dry runs without a redis server and as the
/// store stub in tests. Call counters and failure injection are per store, and
/// shared between clones.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    sets: Mutex<HashMap<String, HashMap<String, f64>>>,
    write_calls: AtomicUsize,
    read_calls: AtomicUsize,
    // 1-based call numbers; 0 disables injection.
    fail_write_on: AtomicUsize,
    fail_read_on: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_calls(&self) -> usize {
        self.inner.write_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.inner.read_calls.load(Ordering::SeqCst)
    }

    /// Makes the `n`th write call (1-based) fail.
    #[cfg(test)]
    pub fn fail_write_on(self, n: usize) -> Self {
        self.inner.fail_write_on.store(n, Ordering::SeqCst);
        self
    }

    /// Makes the `n`th read call (1-based) fail. Both `top_n` and `count_all`
    /// are read calls.
    #[cfg(test)]
    pub fn fail_read_on(self, n: usize) -> Self {
        self.inner.fail_read_on.store(n, Ordering::SeqCst);
        self
    }

    fn record_write(&self) -> StoreResult<()> {
        let call = self.inner.write_calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.inner.fail_write_on.load(Ordering::SeqCst) {
            n if n == call => Err(StoreError::Injected(call)),
            _ => Ok(()),
        }
    }

    fn record_read(&self) -> StoreResult<()> {
        let call = self.inner.read_calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.inner.fail_read_on.load(Ordering::SeqCst) {
            n if n == call => Err(StoreError::Injected(call)),
            _ => Ok(()),
        }
    }

    fn with_set<T>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, f64>) -> T) -> T {
        // A poisoned lock only means another test thread panicked mid-update.
        let mut sets = self
            .inner
            .sets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(sets.entry_ref(key).or_default())
    }
}

#[async_trait]
impl ScoreStore for MemoryStore {
    async fn increment_score(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64> {
        self.record_write()?;
        Ok(self.with_set(key, |set| {
            let score = set.entry_ref(member).or_insert(0.0);
            *score += delta;
            *score
        }))
    }

    async fn set_score(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        self.record_write()?;
        Ok(self.with_set(key, |set| set.insert(member.to_string(), score).is_none()))
    }

    async fn top_n(&self, key: &str, n: usize) -> StoreResult<Vec<String>> {
        self.record_read()?;
        Ok(self.with_set(key, |set| {
            let mut ranked: Vec<(&String, &f64)> = set.iter().collect();
            // Same order as ZREVRANGE: score descending, ties by member descending.
            ranked.sort_by(|a, b| b.1.total_cmp(a.1).then_with(|| b.0.cmp(a.0)));
            ranked
                .into_iter()
                .take(n)
                .map(|(member, _)| member.clone())
                .collect()
        }))
    }

    async fn count_all(&self, key: &str) -> StoreResult<u64> {
        self.record_read()?;
        Ok(self.with_set(key, |set| set.len() as u64))
    }
}
