mod config;
mod coordinator;
mod dispatch;
mod sample;
mod store;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{Backend, Config};
use crate::coordinator::Coordinator;
use crate::store::{MemoryStore, RedisStore, ScoreStore};

const CONFIG_FILE: &str = "config.toml";

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::new(CONFIG_FILE).context("Error loading config")?;
    tracing_subscriber::fmt::init();
    tracing::debug!("Loaded {:?}", config);

    let rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    match config.backend {
        Backend::Redis => {
            let store = RedisStore::connect(&config.redis_host, config.redis_port).await?;
            run(config, store, rng).await
        }
        Backend::Memory => {
            let store = MemoryStore::new();
            run(config, store.clone(), rng).await?;
            tracing::info!(
                "Memory store saw {} writes and {} reads",
                store.write_calls(),
                store.read_calls()
            );
            Ok(())
        }
    }
}

async fn run<S: ScoreStore>(config: Config, store: S, rng: StdRng) -> anyhow::Result<()> {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Ctrl-C received, shutting down"),
            Err(err) => {
                // Without a signal handler the run can only end on completion.
                tracing::debug!("{}", err);
                std::future::pending::<()>().await
            }
        }
    };
    let mut coordinator = Coordinator::new(config);
    let result = coordinator.run(store, rng, interrupt).await;
    tracing::debug!("Coordinator finished in phase {:?}", coordinator.phase());
    let report = result?;
    println!("\n{}", report);
    Ok(())
}
