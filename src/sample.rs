use std::fmt;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Duration, Instant};

use crate::config::Config;
use crate::store::{ScoreStore, StoreResult};

/// One read of the leaderboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub top_n: usize,
    pub returned: usize,
    pub count: u64,
    pub read_latency: Duration,
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Got top {} scores ({} returned) in {:?}. {} scores in the leaderboard",
            self.top_n, self.returned, self.read_latency, self.count
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleExit {
    /// Stop request received and acknowledged.
    Stopped,
    /// A store read failed, the loop ended on its own.
    ReadFailed,
    /// The handle was dropped without asking the loop to stop.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSummary {
    pub cycles: usize,
    pub exit: SampleExit,
}

pub struct SampleLoop<S> {
    store: S,
    key: String,
    top_n: usize,
    interval: Duration,
}

impl<S: ScoreStore> SampleLoop<S> {
    pub fn new(store: S, config: &Config) -> Self {
        Self {
            store,
            key: config.leaderboard_key.clone(),
            top_n: config.top_n,
            interval: config.sample_interval(),
        }
    }

    pub fn start(self) -> SamplerHandle {
        tracing::debug!("Starting SampleLoop");
        // A single stop request is ever sent.
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(self.run(stop_rx));
        tracing::info!("SampleLoop started");
        SamplerHandle { stop_tx, task }
    }

    async fn run(self, mut stop_rx: mpsc::Receiver<oneshot::Sender<()>>) -> SampleSummary {
        let mut cycles = 0;
        loop {
            // The stop request is only looked at between cycles, so it never
            // cuts a store call short. `biased` makes a pending stop win over
            // an interval that elapsed at the same time.
            tokio::select! {
                biased;
                stop = stop_rx.recv() => {
                    let exit = match stop {
                        Some(ack_tx) => {
                            tracing::debug!("Stop received after {} samples", cycles);
                            // Acknowledging is the last thing this loop does.
                            let _ = ack_tx.send(());
                            SampleExit::Stopped
                        }
                        None => SampleExit::Abandoned,
                    };
                    return SampleSummary { cycles, exit };
                },
                _ = tokio::time::sleep(self.interval) => {},
            }
            match self.sample().await {
                Ok(sample) => {
                    cycles += 1;
                    tracing::info!("{}", sample);
                }
                Err(err) => {
                    tracing::warn!("Leaderboard read failed, sampling stopped: {}", err);
                    return SampleSummary {
                        cycles,
                        exit: SampleExit::ReadFailed,
                    };
                }
            }
        }
    }

    async fn sample(&self) -> StoreResult<Sample> {
        let start = Instant::now();
        let returned = self.store.top_n(&self.key, self.top_n).await?.len();
        let read_latency = start.elapsed();
        let count = self.store.count_all(&self.key).await?;
        Ok(Sample {
            top_n: self.top_n,
            returned,
            count,
            read_latency,
        })
    }
}

pub struct SamplerHandle {
    stop_tx: mpsc::Sender<oneshot::Sender<()>>,
    task: JoinHandle<SampleSummary>,
}

impl SamplerHandle {
    /// Asks the loop to stop and waits for its acknowledgment. Consuming the
    /// handle means a loop is stopped at most once. A loop that already ended
    /// on a failed read is simply joined.
    pub async fn stop(self) -> Result<SampleSummary, JoinError> {
        tracing::debug!("Sending stop signal to SampleLoop");
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.stop_tx.send(ack_tx).await.is_ok() {
            // Dropped unanswered only when the loop ended on its own first.
            if ack_rx.await.is_ok() {
                tracing::debug!("SampleLoop acknowledged stop");
            }
        }
        self.task.await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
