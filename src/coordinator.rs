use std::fmt;
use std::future::Future;

use rand::Rng;
use tokio::task::JoinError;
use tokio::time::{Duration, Instant};

use crate::config::Config;
use crate::dispatch::{Completion, TaskSampler, Tally, WriteDispatcher};
use crate::sample::{SampleLoop, SampleSummary};
use crate::store::ScoreStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Dispatcher and sampler are both started.
    Running,
    /// Write completion observed, sampler asked to stop.
    Stopping,
    /// Sampler acknowledged.
    Done,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("writes did not resolve within {0:?}")]
    CompletionTimeout(Duration),
    #[error("write completion was lost before every write resolved")]
    CompletionLost,
    #[error("interrupted before every write resolved")]
    Interrupted,
    #[error("sampler task failed: {0}")]
    Sampler(#[from] JoinError),
}

/// Final summary of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub requests: usize,
    pub tally: Tally,
    pub elapsed: Duration,
    pub injected_latency: Duration,
    pub sampling: SampleSummary,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} requests completed in {:?}", self.requests, self.elapsed)?;
        writeln!(
            f,
            "{} succeeded, {} failed",
            self.tally.succeeded, self.tally.failed
        )?;
        writeln!(f, "{:?} of artificial latency", self.injected_latency)?;
        write!(f, "{} leaderboard samples taken", self.sampling.cycles)
    }
}

pub struct Coordinator {
    config: Config,
    phase: Option<Phase>,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            phase: None,
        }
    }

    /// `None` until `run` has started both loops.
    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    fn advance(&mut self, next: Phase) {
        let legal = matches!(
            (self.phase, next),
            (None, Phase::Running)
                | (Some(Phase::Running), Phase::Stopping)
                | (Some(Phase::Stopping), Phase::Done)
        );
        debug_assert!(legal, "illegal transition {:?} -> {:?}", self.phase, next);
        tracing::debug!("Coordinator {:?} -> {:?}", self.phase, next);
        self.phase = Some(next);
    }

    /// Runs one batch of writes against `store` while sampling it, then shuts
    /// the sampler down. `interrupt` resolving before the batch completes
    /// aborts the wait, the sampler is still stopped cleanly.
    pub async fn run<S, R, I>(
        &mut self,
        store: S,
        rng: R,
        interrupt: I,
    ) -> Result<RunReport, RunError>
    where
        S: ScoreStore,
        R: Rng + Send + 'static,
        I: Future<Output = ()>,
    {
        let config = &self.config;
        tracing::info!("Preparing to send {} requests", config.requests);
        tracing::info!("Simulating max {} users", config.users);

        let start = Instant::now();
        let sampler = TaskSampler::new(rng, config.users, config.score_bound, config.max_latency());
        let dispatch = WriteDispatcher::new(config).start(store.clone(), sampler);
        let sampling = SampleLoop::new(store, config).start();
        let timeout = config.completion_timeout();
        self.advance(Phase::Running);

        let completion = tokio::select! {
            completion = wait_for(dispatch.completion(), timeout) => completion,
            _ = interrupt => Err(RunError::Interrupted),
        };
        self.advance(Phase::Stopping);
        if sampling.is_finished() {
            tracing::debug!("SampleLoop already ended on its own");
        }
        let summary = sampling.stop().await?;
        self.advance(Phase::Done);

        let Completion {
            tally,
            injected_latency,
        } = completion?;
        Ok(RunReport {
            requests: self.config.requests,
            tally,
            elapsed: start.elapsed(),
            injected_latency,
            sampling: summary,
        })
    }
}

async fn wait_for<F>(completion: F, timeout: Option<Duration>) -> Result<Completion, RunError>
where
    F: Future<Output = Option<Completion>>,
{
    let completion = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, completion)
            .await
            .map_err(|_| RunError::CompletionTimeout(timeout))?,
        None => completion.await,
    };
    completion.ok_or(RunError::CompletionLost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompletionPolicy;
    use crate::sample::SampleExit;
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

    #[tokio::test(start_paused = true)]
    async fn runs_to_done_and_reports() {
        let store = MemoryStore::new();
        let mut coordinator = Coordinator::new(config(100, 10));
        assert_eq!(coordinator.phase(), None);

        let report = coordinator
            .run(store.clone(), StdRng::seed_from_u64(1), std::future::pending())
            .await
            .unwrap();
        assert_eq!(coordinator.phase(), Some(Phase::Done));
        assert_eq!(store.write_calls(), 100);
        assert_eq!(report.requests, 100);
        assert_eq!(report.tally, Tally { succeeded: 100, failed: 0 });
        assert!(report.elapsed >= report.injected_latency);
        assert_eq!(report.sampling.exit, SampleExit::Stopped);
        assert!(store.count_all("leaderboard").await.unwrap() <= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_runs_alongside_a_long_dispatch() {
        let store = MemoryStore::new();
        let config = Config {
            max_latency_ms: 100,
            sample_interval_ms: 250,
            ..config(200, 50)
        };
        let report = Coordinator::new(config)
            .run(store.clone(), StdRng::seed_from_u64(2), std::future::pending())
            .await
            .unwrap();
        // A cycle due at the very instant of completion may or may not run.
        let due = (report.elapsed.as_millis() / 250) as usize;
        assert!(due > 0);
        assert!(report.sampling.cycles == due || report.sampling.cycles + 1 == due);
        assert_eq!(store.read_calls(), report.sampling.cycles * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn one_failed_write_still_reaches_done() {
        let store = MemoryStore::new().fail_write_on(50);
        let mut coordinator = Coordinator::new(config(100, 10));
        let report = coordinator
            .run(store, StdRng::seed_from_u64(3), std::future::pending())
            .await
            .unwrap();
        assert_eq!(report.tally, Tally { succeeded: 99, failed: 1 });
        assert_eq!(coordinator.phase(), Some(Phase::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn success_only_policy_loses_completion() {
        let config = Config {
            policy: CompletionPolicy::SuccessOnly,
            ..config(100, 10)
        };
        let mut coordinator = Coordinator::new(config);
        let result = coordinator
            .run(
                MemoryStore::new().fail_write_on(50),
                StdRng::seed_from_u64(3),
                std::future::pending(),
            )
            .await;
        assert!(matches!(result, Err(RunError::CompletionLost)));
        // The sampler is still shut down.
        assert_eq!(coordinator.phase(), Some(Phase::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_bounds_the_wait() {
        let config = Config {
            max_latency_ms: 4,
            completion_timeout_ms: 10,
            ..config(1000, 10)
        };
        let mut coordinator = Coordinator::new(config);
        let result = coordinator
            .run(MemoryStore::new(), StdRng::seed_from_u64(4), std::future::pending())
            .await;
        assert!(matches!(
            result,
            Err(RunError::CompletionTimeout(timeout)) if timeout == Duration::from_millis(10)
        ));
        assert_eq!(coordinator.phase(), Some(Phase::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_stops_the_sampler() {
        let store = MemoryStore::new();
        let mut coordinator = Coordinator::new(config(5000, 10));
        let interrupt = tokio::time::sleep(Duration::from_millis(1500));
        let result = coordinator
            .run(store.clone(), StdRng::seed_from_u64(5), interrupt)
            .await;
        assert!(matches!(result, Err(RunError::Interrupted)));
        assert_eq!(coordinator.phase(), Some(Phase::Done));
        let reads = store.read_calls();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.read_calls(), reads);
    }

    #[test]
    fn report_lines() {
        let report = RunReport {
            requests: 100,
            tally: Tally { succeeded: 99, failed: 1 },
            elapsed: Duration::from_millis(250),
            injected_latency: Duration::from_millis(200),
            sampling: SampleSummary {
                cycles: 0,
                exit: SampleExit::Stopped,
            },
        };
        assert_eq!(
            report.to_string(),
            "100 requests completed in 250ms\n99 succeeded, 1 failed\n200ms of artificial latency\n0 leaderboard samples taken"
        );
    }
}
