// Runs the workflow `iterations` times, each with its own seed.

use anyhow::{Context, Result};
use async_stream::try_stream;
use futures::{Stream, StreamExt};
use log::debug;
use rand::Rng;
use tokio_retry::{strategy::ExponentialBackoff, Retry};

use crate::{
    backend::ComfyBackend,
    config::RunnerConfig,
    flow::build_workflow,
    utils::{self, SavedImage},
};

/// run() returns a stream of these.
#[derive(Debug)]
pub enum RunEvent {
    /// An iteration has been built and is about to be queued.
    Started { iteration: u32, seed: u64 },
    /// An iteration finished and its images are on disk.
    Completed {
        iteration: u32,
        seed: u64,
        images: Vec<SavedImage>,
    },
    /// Something broke.
    /// The runner has stopped.
    Error(anyhow::Error),
}

/// A fixed seed counts up per iteration; otherwise every iteration gets a random one.
pub fn seed_for(configured: Option<u64>, iteration: u32) -> u64 {
    match configured {
        Some(seed) => seed.wrapping_add(iteration as u64),
        None => rand::thread_rng().gen_range(1..=u64::MAX),
    }
}

/// Five tries: the first attempt plus four retries.
fn retry_strategy() -> impl Iterator<Item = std::time::Duration> {
    ExponentialBackoff::from_millis(50)
        .max_delay(std::time::Duration::from_secs(2))
        .take(4)
}

/// The log line for one saved image.
pub fn describe_saved(iteration: u32, seed: u64, image: &SavedImage) -> String {
    format!(
        "Iteration {} (seed {}): saved {} ({}x{})",
        iteration,
        seed,
        image.path.display(),
        image.width,
        image.height
    )
}

pub fn run(config: RunnerConfig, backend: ComfyBackend) -> impl Stream<Item = RunEvent> {
    try_stream! {
        for iteration in 0..config.iterations {
            let seed = seed_for(config.workflow.sampler.seed, iteration);
            yield RunEvent::Started { iteration, seed };

            let flow = build_workflow(&config.workflow, seed)
                .context("Failed to build workflow")?;
            debug!("Workflow: {}", flow.to_prompt());
            let images = Retry::spawn(retry_strategy(), || async {
                backend.generate(&flow).await.context("Failed to generate images")
            }).await.context("Ran out of retries")?;

            let prefix = &config.workflow.filename_prefix;
            let saved = utils::save_images(&config.output_dir, prefix, &images)
                .context("Failed to save images")?;
            yield RunEvent::Completed { iteration, seed, images: saved };
        }
    }
    .map(|r: Result<RunEvent>| r.unwrap_or_else(RunEvent::Error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    #[test]
    fn test_fixed_seed_counts_up() {
        assert_eq!(seed_for(Some(7), 0), 7);
        assert_eq!(seed_for(Some(7), 2), 9);
        assert_eq!(seed_for(Some(u64::MAX), 1), 0);
    }

    #[test]
    fn test_five_tries() {
        // Retry::spawn makes one attempt per delay, plus the first.
        assert_eq!(retry_strategy().count() + 1, 5);
    }

    #[test]
    fn test_describe_saved() {
        let image = SavedImage {
            path: std::path::PathBuf::from("output/ComfyUI_0123456789abcdef.png"),
            width: 1320,
            height: 1024,
        };
        assert_eq!(
            describe_saved(1, 99, &image),
            "Iteration 1 (seed 99): saved output/ComfyUI_0123456789abcdef.png (1320x1024)"
        );
    }

    #[test]
    fn test_random_seed_is_nonzero() {
        for _ in 0..100 {
            assert_ne!(seed_for(None, 0), 0);
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend_ends_in_error() {
        let mut config = RunnerConfig::default();
        config.workflow.sampler.seed = Some(5);
        config.iterations = 3;
        config.backend = BackendConfig {
            port: 9,
            ..Default::default()
        };
        let backend = ComfyBackend::new(&config.backend);
        let events: Vec<RunEvent> = run(config, backend).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RunEvent::Started { iteration: 0, seed: 5 }));
        assert!(matches!(events[1], RunEvent::Error(_)));
    }
}
