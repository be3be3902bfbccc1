use crate::config::Config;
use crate::daemon::buttons::{DispatchTiming, GpioLines, InputDispatcher};
use crate::daemon::display::{DisplayRenderer, FramebufferPanel, RendererSettings};
use crate::remote::RemoteClient;
use eyre::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

mod buttons;
mod display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loops {
    Buttons,
    Display,
    Both,
}

impl Loops {
    fn buttons(self) -> bool {
        matches!(self, Loops::Buttons | Loops::Both)
    }

    fn display(self) -> bool {
        matches!(self, Loops::Display | Loops::Both)
    }
}

/// Resolves once the shutdown flag is raised or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[tracing::instrument(skip(config))]
pub async fn run(config: Config, loops: Loops) -> eyre::Result<()> {
    let remote = Arc::new(RemoteClient::new(&config.remote)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    if loops.buttons() {
        let lines = GpioLines::claim(&config.bindings).context("Failed to claim button lines")?;
        let dispatcher = InputDispatcher::new(
            lines,
            remote.clone(),
            config.player.clone(),
            config.bindings.clone(),
            DispatchTiming::default(),
        );
        tasks.spawn(dispatcher.run(shutdown_rx.clone()));
    }

    if loops.display() {
        let panel = FramebufferPanel::open(&config.panel).context("Failed to open display")?;
        let settings = RendererSettings::new(
            config.player.clone(),
            config.brightness_entity.clone(),
            config.images.clone(),
        );
        let renderer = DisplayRenderer::new(panel, remote.clone(), settings);
        tasks.spawn(renderer.run(shutdown_rx.clone()));
    }
    info!("Pirate deck running ({:?})", loops);

    tokio::select! {
        signal = shutdown_signal() => {
            match signal {
                Ok(name) => info!("Received {}, shutting down gracefully", name),
                Err(e) => warn!(error = %e, "Error waiting for stop signal"),
            }
        }
        Some(finished) = tasks.join_next() => {
            warn!("A control loop ended on its own: {:?}", finished);
        }
    }

    shutdown_tx.send_replace(true);
    while let Some(finished) = tasks.join_next().await {
        finished.context("Control loop panicked")??;
    }
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<&'static str> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}
