use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::config::{CompletionPolicy, Config, WriteMode};
use crate::store::ScoreStore;

// Outcomes are drained continuously by the listener.
const OUTCOME_BUFFER: usize = 1024;

/// One simulated score submission. Lives from the draw until its outcome has
/// been reported.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteTask {
    pub user: String,
    pub score: f64,
    pub latency: Duration,
}

/// Draws write tasks from bounded ranges.
pub struct TaskSampler<R> {
    rng: R,
    users: usize,
    score_bound: u32,
    max_latency_ms: u64,
}

impl<R: Rng> TaskSampler<R> {
    pub fn new(rng: R, users: usize, score_bound: u32, max_latency: Duration) -> Self {
        Self {
            rng,
            users: users.max(1),
            score_bound: score_bound.max(1),
            max_latency_ms: max_latency.as_millis() as u64,
        }
    }

    /// User in `user-0..user-{users-1}`, score in `0..score_bound`, latency in
    /// `0..=max_latency` whole milliseconds.
    pub fn draw(&mut self) -> WriteTask {
        let latency = Duration::from_millis(self.rng.gen_range(0..=self.max_latency_ms));
        let user = format!("user-{}", self.rng.gen_range(0..self.users));
        let score = f64::from(self.rng.gen_range(0..self.score_bound));
        WriteTask {
            user,
            score,
            latency,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub succeeded: usize,
    pub failed: usize,
}

impl Tally {
    fn record(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Succeeded => self.succeeded += 1,
            WriteOutcome::Failed => self.failed += 1,
        }
    }

    pub fn resolved(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Sent exactly once, after every write of the batch has resolved and the
/// dispatch loop has finished drawing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub tally: Tally,
    pub injected_latency: Duration,
}

pub struct WriteDispatcher {
    key: Arc<str>,
    requests: usize,
    mode: WriteMode,
    policy: CompletionPolicy,
    max_in_flight: Option<usize>,
}

impl WriteDispatcher {
    pub fn new(config: &Config) -> Self {
        Self {
            key: Arc::from(config.leaderboard_key.as_str()),
            requests: config.requests,
            mode: config.write_mode,
            policy: config.policy,
            max_in_flight: config.max_in_flight(),
        }
    }

    /// Spawns the dispatch loop and the completion listener. The returned
    /// handle resolves once the whole batch has resolved.
    pub fn start<S, R>(self, store: S, sampler: TaskSampler<R>) -> DispatchHandle
    where
        S: ScoreStore,
        R: Rng + Send + 'static,
    {
        tracing::debug!("Starting WriteDispatcher");
        let (outcome_tx, outcome_rx) = mpsc::channel(OUTCOME_BUFFER);
        let (latency_tx, latency_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let requests = self.requests;
        tokio::spawn(listen(requests, outcome_rx, latency_rx, done_tx));
        tokio::spawn(async move {
            let injected_latency = self.dispatch(store, sampler, outcome_tx).await;
            // The listener may already be gone if it gave up, nothing to do then.
            let _ = latency_tx.send(injected_latency);
        });
        tracing::info!("WriteDispatcher started");
        DispatchHandle { done_rx }
    }

    async fn dispatch<S, R>(
        self,
        store: S,
        mut sampler: TaskSampler<R>,
        outcome_tx: mpsc::Sender<WriteOutcome>,
    ) -> Duration
    where
        S: ScoreStore,
        R: Rng + Send + 'static,
    {
        let semaphore = self.max_in_flight.map(|n| Arc::new(Semaphore::new(n)));
        let mut injected_latency = Duration::ZERO;
        for _ in 0..self.requests {
            let task = sampler.draw();
            injected_latency += task.latency;
            // Arrival jitter: this delays the next launch, not the write itself.
            tokio::time::sleep(task.latency).await;
            let permit = match &semaphore {
                Some(semaphore) => match semaphore.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
                None => None,
            };
            tokio::spawn(write(
                store.clone(),
                self.key.clone(),
                task,
                self.mode,
                self.policy,
                outcome_tx.clone(),
                permit,
            ));
        }
        tracing::debug!(
            "Dispatched {} writes with {:?} of injected latency",
            self.requests,
            injected_latency
        );
        injected_latency
    }
}

async fn write<S: ScoreStore>(
    store: S,
    key: Arc<str>,
    task: WriteTask,
    mode: WriteMode,
    policy: CompletionPolicy,
    outcome_tx: mpsc::Sender<WriteOutcome>,
    permit: Option<OwnedSemaphorePermit>,
) {
    let result = match mode {
        WriteMode::Increment => store
            .increment_score(&key, &task.user, task.score)
            .await
            .map(|_| ()),
        WriteMode::Set => store
            .set_score(&key, &task.user, task.score)
            .await
            .map(|added| {
                if added {
                    tracing::debug!("User {} added to the leaderboard", task.user);
                } else {
                    tracing::debug!("User {} updated on the leaderboard", task.user);
                }
            }),
    };
    drop(permit);
    let outcome = match result {
        Ok(()) => WriteOutcome::Succeeded,
        Err(err) => {
            tracing::warn!("Write for {} failed: {}", task.user, err);
            match policy {
                CompletionPolicy::AllResolutions => WriteOutcome::Failed,
                // The failure is swallowed and the batch can never complete.
                CompletionPolicy::SuccessOnly => return,
            }
        }
    };
    // The listener stops once the batch is resolved; late sends are harmless.
    let _ = outcome_tx.send(outcome).await;
}

async fn listen(
    requests: usize,
    outcome_rx: mpsc::Receiver<WriteOutcome>,
    latency_rx: oneshot::Receiver<Duration>,
    done_tx: oneshot::Sender<Completion>,
) {
    let mut outcomes = ReceiverStream::new(outcome_rx).take(requests);
    let mut tally = Tally::default();
    while let Some(outcome) = outcomes.next().await {
        tally.record(outcome);
    }
    if tally.resolved() < requests {
        // Every sender is gone without the batch resolving: some writes were
        // dropped silently. Dropping `done_tx` is the only signal left.
        tracing::warn!(
            "Outcome channel closed after {} of {} writes resolved",
            tally.resolved(),
            requests
        );
        return;
    }
    // The dispatch loop sends its total after its last draw, so reading it
    // here happens-after every addition to it.
    let Ok(injected_latency) = latency_rx.await else {
        return;
    };
    tracing::debug!("All {} writes resolved: {:?}", requests, tally);
    let _ = done_tx.send(Completion {
        tally,
        injected_latency,
    });
}

pub struct DispatchHandle {
    done_rx: oneshot::Receiver<Completion>,
}

impl DispatchHandle {
    /// `None` when the batch can no longer complete.
    pub async fn completion(self) -> Option<Completion> {
        self.done_rx.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(requests: usize, users: usize) -> Config {
        Config {
            requests,
            users,
            ..Config::default()
        }
    }

    fn sampler(config: &Config, seed: u64) -> TaskSampler<StdRng> {
        TaskSampler::new(
            StdRng::seed_from_u64(seed),
            config.users,
            config.score_bound,
            config.max_latency(),
        )
    }

    async fn run(config: &Config, store: &MemoryStore, seed: u64) -> Option<Completion> {
        WriteDispatcher::new(config)
            .start(store.clone(), sampler(config, seed))
            .completion()
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn completes_once_every_write_resolved() {
        for (requests, users) in [(1, 1), (17, 1), (64, 3), (250, 1000)] {
            let config = config(requests, users);
            let store = MemoryStore::new();
            let completion = run(&config, &store, requests as u64).await.unwrap();
            assert_eq!(completion.tally.succeeded, requests);
            assert_eq!(completion.tally.failed, 0);
            assert_eq!(store.write_calls(), requests);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_requests_complete_immediately() {
        let store = MemoryStore::new();
        let start = tokio::time::Instant::now();
        let completion = run(&config(0, 10), &store, 1).await.unwrap();
        assert_eq!(completion.tally, Tally::default());
        assert_eq!(completion.injected_latency, Duration::ZERO);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(store.write_calls(), 0);
    }

    #[test]
    fn draws_stay_within_bounds() {
        let mut sampler = TaskSampler::new(StdRng::seed_from_u64(7), 3, 10, Duration::from_millis(4));
        let mut seen_users = hashbrown::HashSet::new();
        let mut max_latency = Duration::ZERO;
        let mut max_score: f64 = 0.0;
        for _ in 0..10_000 {
            let task = sampler.draw();
            let id: usize = task.user.strip_prefix("user-").unwrap().parse().unwrap();
            assert!(id < 3);
            assert!((0.0..10.0).contains(&task.score));
            assert!(task.latency <= Duration::from_millis(4));
            seen_users.insert(id);
            max_latency = max_latency.max(task.latency);
            max_score = max_score.max(task.score);
        }
        // Boundaries are actually reached.
        assert_eq!(seen_users.len(), 3);
        assert_eq!(max_latency, Duration::from_millis(4));
        assert_eq!(max_score, 9.0);
    }

    #[test]
    fn single_user_space_always_draws_user_zero() {
        let mut sampler = TaskSampler::new(StdRng::seed_from_u64(3), 0, 1, Duration::ZERO);
        for _ in 0..100 {
            let task = sampler.draw();
            assert_eq!(task.user, "user-0");
            assert_eq!(task.score, 0.0);
            assert_eq!(task.latency, Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn injected_latency_is_the_sum_of_draws() {
        let config = config(300, 20);
        let mut replay = sampler(&config, 42);
        let expected: Duration = (0..config.requests).map(|_| replay.draw().latency).sum();

        let store = MemoryStore::new();
        let start = tokio::time::Instant::now();
        let completion = run(&config, &store, 42).await.unwrap();
        assert_eq!(completion.injected_latency, expected);
        assert!(start.elapsed() >= expected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_still_resolves_the_batch() {
        let config = config(100, 10);
        let store = MemoryStore::new().fail_write_on(37);
        let completion = run(&config, &store, 5).await.unwrap();
        assert_eq!(completion.tally.succeeded, 99);
        assert_eq!(completion.tally.failed, 1);
        assert_eq!(completion.tally.resolved(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn success_only_policy_never_completes_after_a_failure() {
        let config = Config {
            policy: CompletionPolicy::SuccessOnly,
            ..config(100, 10)
        };
        let store = MemoryStore::new().fail_write_on(37);
        assert_eq!(run(&config, &store, 5).await, None);
        assert_eq!(store.write_calls(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_fan_out_keeps_the_completion_contract() {
        let config = Config {
            max_in_flight: 2,
            write_mode: WriteMode::Set,
            ..config(120, 5)
        };
        let store = MemoryStore::new();
        let completion = run(&config, &store, 9).await.unwrap();
        assert_eq!(completion.tally.succeeded, 120);
        assert_eq!(store.write_calls(), 120);
        assert!(store.count_all(&config.leaderboard_key).await.unwrap() <= 5);
    }
}
