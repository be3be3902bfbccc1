use crate::config::PanelConfig;
use crate::daemon::display::frame;
use async_trait::async_trait;
use image::RgbImage;
use rppal::gpio::{Gpio, OutputPin};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, instrument};

/// Native resolution of the accessory's ST7789 panel.
pub const PANEL_SIZE: (u32, u32) = (240, 240);

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("framebuffer {0:?} does not exist")]
    Missing(PathBuf),
    #[error("framebuffer write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("backlight GPIO failed: {0}")]
    Gpio(#[from] rppal::gpio::Error),
}

#[async_trait]
pub trait Panel: Send {
    fn size(&self) -> (u32, u32);

    /// Puts `frame` on screen with the backlight on. `frame` is already
    /// `size()` pixels.
    async fn show(&mut self, frame: &RgbImage) -> Result<(), PanelError>;
}

/// The panel as exposed by the fbtft driver: a 16bpp framebuffer device plus
/// a separate backlight line.
pub struct FramebufferPanel {
    path: PathBuf,
    rotation: u16,
    backlight: OutputPin,
}

impl FramebufferPanel {
    pub fn open(config: &PanelConfig) -> Result<Self, PanelError> {
        if !config.framebuffer.exists() {
            return Err(PanelError::Missing(config.framebuffer.clone()));
        }
        let mut backlight = Gpio::new()?.get(config.backlight_pin)?.into_output();
        backlight.set_low();
        debug!(
            "Opened panel at {:?}, backlight on line {}",
            config.framebuffer, config.backlight_pin
        );
        Ok(FramebufferPanel {
            path: config.framebuffer.clone(),
            rotation: config.rotation,
            backlight,
        })
    }
}

#[async_trait]
impl Panel for FramebufferPanel {
    fn size(&self) -> (u32, u32) {
        PANEL_SIZE
    }

    #[instrument(skip_all, level = "trace")]
    async fn show(&mut self, frame: &RgbImage) -> Result<(), PanelError> {
        let raw = frame::to_rgb565(&frame::rotate(frame, self.rotation));
        tokio::fs::write(&self.path, &raw).await?;
        self.backlight.set_high();
        Ok(())
    }
}

impl Drop for FramebufferPanel {
    fn drop(&mut self) {
        self.backlight.set_low();
    }
}
