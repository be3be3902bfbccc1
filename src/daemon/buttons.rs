use crate::config::InputBinding;
use crate::daemon::stopped;
use crate::remote::Remote;
use rppal::gpio::{Gpio, InputPin};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("GPIO access failed: {0}")]
    Gpio(#[from] rppal::gpio::Error),
    #[error("line {0} was never claimed")]
    Unclaimed(u8),
}

/// Source of logic levels for the configured button lines.
pub trait InputLines: Send {
    fn read(&mut self, line: u8) -> Result<Level, InputError>;
}

/// Button lines claimed from the SoC GPIO controller as pulled-up inputs.
/// Dropping this releases the pins.
pub struct GpioLines {
    pins: HashMap<u8, InputPin>,
}

impl GpioLines {
    pub fn claim(bindings: &[InputBinding]) -> Result<Self, InputError> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::with_capacity(bindings.len());
        for binding in bindings {
            pins.insert(binding.line, gpio.get(binding.line)?.into_input_pullup());
            debug!("Claimed line {} for {}", binding.line, binding.command);
        }
        Ok(GpioLines { pins })
    }
}

impl InputLines for GpioLines {
    fn read(&mut self, line: u8) -> Result<Level, InputError> {
        let pin = self.pins.get(&line).ok_or(InputError::Unclaimed(line))?;
        Ok(if pin.is_low() { Level::Low } else { Level::High })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTiming {
    /// Pause between sweeps that fired nothing.
    pub sweep_interval: Duration,
    /// Pause after a fired command, during which no line is read.
    pub cooldown: Duration,
}

impl Default for DispatchTiming {
    fn default() -> Self {
        DispatchTiming {
            sweep_interval: Duration::from_millis(50),
            cooldown: Duration::from_millis(400),
        }
    }
}

pub struct InputDispatcher<L, R: ?Sized> {
    lines: L,
    remote: Arc<R>,
    entity_id: Arc<String>,
    bindings: Arc<[InputBinding]>,
    pressed: Vec<bool>,
    timing: DispatchTiming,
}

impl<L, R> InputDispatcher<L, R>
where
    L: InputLines,
    R: Remote + ?Sized,
{
    pub fn new(
        lines: L,
        remote: Arc<R>,
        entity_id: Arc<String>,
        bindings: Arc<[InputBinding]>,
        timing: DispatchTiming,
    ) -> Self {
        let pressed = vec![false; bindings.len()];
        InputDispatcher {
            lines,
            remote,
            entity_id,
            bindings,
            pressed,
            timing,
        }
    }

    /// Reads every line once, in binding order. A line going from released
    /// to pressed fires its command and then holds the whole sweep for the
    /// cooldown. Returns the number of commands fired.
    #[instrument(skip_all, level = "trace")]
    pub async fn poll(&mut self) -> usize {
        let bindings = self.bindings.clone();
        let mut fired = 0;
        for (i, binding) in bindings.iter().enumerate() {
            let level = match self.lines.read(binding.line) {
                Ok(level) => level,
                Err(e) => {
                    warn!(error = %e, line = binding.line, "Unable to read button line");
                    continue;
                }
            };
            let is_pressed = level == Level::Low;
            let was_pressed = std::mem::replace(&mut self.pressed[i], is_pressed);
            if is_pressed && !was_pressed {
                info!("GPIO {} -> {}", binding.line, binding.command);
                self.fire(binding).await;
                fired += 1;
                tokio::time::sleep(self.timing.cooldown).await;
            }
        }
        fired
    }

    async fn fire(&self, binding: &InputBinding) {
        if let Err(e) = self
            .remote
            .call_service(&binding.command, &self.entity_id)
            .await
        {
            warn!(error = %e, command = %binding.command, "Remote rejected button command");
        }
    }

    #[instrument(skip_all)]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> eyre::Result<()> {
        info!("Watching {} buttons", self.bindings.len());
        while !*shutdown.borrow() {
            if self.poll().await == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.timing.sweep_interval) => {}
                    _ = stopped(&mut shutdown) => break,
                }
            }
        }
        info!("Button loop stopped");
        Ok(())
    }
}
