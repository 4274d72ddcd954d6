use std::path::PathBuf;

use anyhow::{Context, Result};

use clap::Parser;
use config::RunnerConfig;
use futures::StreamExt;
use log::{error, info};

use crate::{backend::ComfyBackend, runner::RunEvent};

mod backend;
mod config;
mod flow;
mod outputs;
mod paths;
mod runner;
mod server;
mod utils;

#[derive(Parser, Debug)]
#[command(about = "Runs the zavychroma txt2img workflow on a ComfyUI server")]
struct CommandLineFlags {
    /// TOML config. Without one, the built-in workflow defaults are used.
    #[arg(long, short)]
    pub config_path: Option<PathBuf>,
    /// Where to start looking for the ComfyUI installation. Defaults to the working directory.
    #[arg(long)]
    pub start_dir: Option<PathBuf>,
    #[arg(long, short)]
    pub output_dir: Option<PathBuf>,
    #[arg(long, short = 'n')]
    pub iterations: Option<u32>,
    #[arg(long)]
    pub seed: Option<u64>,
    /// Print the workflow JSON and exit without contacting the server.
    #[arg(long)]
    pub dry_run: bool,
    /// Don't ask the server whether it has every node class we need.
    #[arg(long)]
    pub skip_node_check: bool,
}

impl CommandLineFlags {
    fn apply(&self, config: &mut RunnerConfig) {
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(iterations) = self.iterations {
            config.iterations = iterations;
        }
        if let Some(seed) = self.seed {
            config.workflow.sampler.seed = Some(seed);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();
    let args = CommandLineFlags::parse();

    // Immediately crash on panic.
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Panic: {:?}", panic_info);
        std::process::exit(1);
    }));

    // Load and check the config before touching anything else.
    let mut config =
        RunnerConfig::load(args.config_path.as_deref()).context("failed to load config")?;
    args.apply(&mut config);
    config.validate().context("invalid config")?;
    config.resolve_client_id();
    info!("Loaded config: {:?}", config);

    if args.dry_run {
        let seed = runner::seed_for(config.workflow.sampler.seed, 0);
        let flow = flow::build_workflow(&config.workflow, seed)?;
        println!("{}", serde_json::to_string_pretty(&flow.to_prompt())?);
        return Ok(());
    }

    // Find the installation, and get a server running.
    let installation = paths::locate_installation(args.start_dir.as_deref())?;
    let backend = ComfyBackend::new(&config.backend);
    let host = server::ensure_server(&config.backend, &backend, &installation).await?;

    if !args.skip_node_check {
        // The seed doesn't matter for the class list.
        let flow = flow::build_workflow(&config.workflow, 0)?;
        backend.check_node_classes(&flow.class_types()).await?;
    }

    let mut events = Box::pin(runner::run(config, backend));
    let mut failure = None;
    while let Some(event) = events.next().await {
        match event {
            RunEvent::Started { iteration, seed } => {
                info!("Iteration {}: sampling with seed {}", iteration, seed)
            }
            RunEvent::Completed { iteration, seed, images } => {
                for image in &images {
                    info!("{}", runner::describe_saved(iteration, seed, image));
                }
            }
            RunEvent::Error(e) => failure = Some(e),
        }
    }

    if let Some(host) = host {
        host.shutdown().await?;
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = CommandLineFlags::parse_from([
            "zavy-runner",
            "--seed",
            "42",
            "-n",
            "3",
            "--output-dir",
            "/tmp/out",
        ]);
        let mut config = RunnerConfig::default();
        args.apply(&mut config);
        assert_eq!(config.workflow.sampler.seed, Some(42));
        assert_eq!(config.iterations, 3);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        assert!(!args.dry_run);
    }

    #[test]
    fn test_flags_verify() {
        use clap::CommandFactory;
        CommandLineFlags::command().debug_assert();
    }
}
