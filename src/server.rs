// Getting a ComfyUI server to talk to.
// Usually one is already running. If not, and we're allowed to, we start one from the
// installation we found and keep it alive for as long as we need it.

use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use tokio::process::{Child, Command};
use tokio_retry::{strategy::ExponentialBackoff, Retry};

use crate::{backend::ComfyBackend, config::BackendConfig, paths::Installation};

/// A ComfyUI process we started. Killed when dropped.
pub struct HostProcess {
    child: Child,
}

impl HostProcess {
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Stopping the ComfyUI server we started");
        self.child.kill().await.context("failed to stop ComfyUI")
    }
}

/// The command line that starts ComfyUI from `installation`.
pub fn launch_command(config: &BackendConfig, installation: &Installation) -> Result<Command> {
    let dir = installation
        .comfyui_dir
        .as_ref()
        .context("no ComfyUI directory found to launch the server from")?;
    let mut command = Command::new(&config.python);
    command
        .current_dir(dir)
        .arg("main.py")
        .arg("--listen")
        .arg(&config.host)
        .arg("--port")
        .arg(config.port.to_string())
        .kill_on_drop(true);
    if let Some(extra) = &installation.extra_model_paths {
        command.arg("--extra-model-paths-config").arg(extra);
    }
    Ok(command)
}

/// Makes sure a server is answering. Returns the process if we had to start it.
pub async fn ensure_server(
    config: &BackendConfig,
    backend: &ComfyBackend,
    installation: &Installation,
) -> Result<Option<HostProcess>> {
    if backend.is_alive().await {
        info!("ComfyUI is up at {}", backend.address());
        return Ok(None);
    }
    if !config.launch {
        bail!(
            "ComfyUI is not reachable at {} (set backend.launch = true to start it automatically)",
            backend.address()
        );
    }

    let mut command = launch_command(config, installation)?;
    debug!("Running {:?}", &command);
    let child = command.spawn().context("failed to start ComfyUI")?;
    let mut process = HostProcess { child };
    info!("Started ComfyUI (pid {:?}), waiting for it to come up", process.child.id());

    // Loading custom nodes can take a while, so back off up to a few seconds between checks.
    let started = Instant::now();
    let timeout = std::time::Duration::from_secs(config.launch_timeout_secs);
    let retry_strategy = ExponentialBackoff::from_millis(2)
        .factor(125)
        .max_delay(std::time::Duration::from_secs(5))
        .take_while(move |_| started.elapsed() < timeout);
    let up = Retry::spawn(retry_strategy, || async {
        if backend.is_alive().await {
            Ok(())
        } else {
            Err(anyhow!("not up yet"))
        }
    })
    .await;

    if up.is_err() {
        if let Some(status) = process.child.try_wait().context("failed to check on ComfyUI")? {
            bail!("ComfyUI exited during startup: {}", status);
        }
        bail!(
            "ComfyUI did not come up at {} within {}s",
            backend.address(),
            config.launch_timeout_secs
        );
    }
    info!("ComfyUI is up at {}", backend.address());
    Ok(Some(process))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_launch_command() {
        let config = BackendConfig {
            python: "python3".to_string(),
            port: 8190,
            ..Default::default()
        };
        let installation = Installation {
            comfyui_dir: Some(PathBuf::from("/opt/ComfyUI")),
            extra_model_paths: Some(PathBuf::from("/opt/extra_model_paths.yaml")),
        };
        let command = launch_command(&config, &installation).unwrap();
        let command = command.as_std();
        assert_eq!(command.get_program(), "python3");
        assert_eq!(command.get_current_dir(), Some(PathBuf::from("/opt/ComfyUI").as_path()));
        let args: Vec<_> = command.get_args().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            args,
            vec![
                "main.py",
                "--listen",
                "127.0.0.1",
                "--port",
                "8190",
                "--extra-model-paths-config",
                "/opt/extra_model_paths.yaml",
            ]
        );
    }

    #[test]
    fn test_launch_needs_installation() {
        assert!(launch_command(&BackendConfig::default(), &Installation::default()).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_without_launch() {
        let config = BackendConfig {
            port: 9,
            ..Default::default()
        };
        let backend = ComfyBackend::new(&config);
        let err = ensure_server(&config, &backend, &Installation::default())
            .await
            .err()
            .unwrap()
            .to_string();
        assert!(err.contains("not reachable"), "{}", err);
    }
}
