use crate::config::ImageSet;
use crate::daemon::stopped;
use crate::remote::{PlaybackObservation, Remote};
use image::RgbImage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, trace, warn};

mod frame;
pub(crate) mod panel;

pub use panel::{FramebufferPanel, Panel};

pub const FULL_BRIGHTNESS: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayMode {
    Boot,
    Idle,
    Airplay,
    Cover,
}

/// Picks the mode for an observation. An AirPlay source wins over the
/// player state; anything but "playing" is idle.
pub fn classify(observation: &PlaybackObservation) -> DisplayMode {
    if observation.is_airplay() {
        DisplayMode::Airplay
    } else if !observation.is_playing() {
        DisplayMode::Idle
    } else {
        DisplayMode::Cover
    }
}

/// Reads a brightness entity state such as `"40.0"` as a whole percentage.
pub fn parse_brightness(state: &str) -> Option<u8> {
    let value: f64 = state.trim().parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(value.trunc().clamp(0.0, 100.0) as u8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Rendered(DisplayMode),
    /// The mode switched but no frame reached the panel.
    Skipped(DisplayMode),
    Unchanged,
    /// The player could not be read or its artwork not shown; Boot is up.
    FellBack,
}

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("{0:?} does not exist")]
    NotFound(PathBuf),
    #[error("unable to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("decoder task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub player: Arc<String>,
    pub brightness_entity: Arc<String>,
    pub images: ImageSet,
    pub tick_period: Duration,
    /// How long the boot image stays up before the first tick.
    pub warmup: Duration,
}

impl RendererSettings {
    pub fn new(player: Arc<String>, brightness_entity: Arc<String>, images: ImageSet) -> Self {
        RendererSettings {
            player,
            brightness_entity,
            images,
            tick_period: Duration::from_secs(1),
            warmup: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Shown {
    mode: DisplayMode,
    artwork: Option<String>,
}

pub struct DisplayRenderer<P, R: ?Sized> {
    panel: P,
    remote: Arc<R>,
    settings: RendererSettings,
    shown: Option<Shown>,
}

impl<P, R> DisplayRenderer<P, R>
where
    P: Panel,
    R: Remote + ?Sized,
{
    pub fn new(panel: P, remote: Arc<R>, settings: RendererSettings) -> Self {
        DisplayRenderer {
            panel,
            remote,
            settings,
            shown: None,
        }
    }

    pub fn current_mode(&self) -> Option<DisplayMode> {
        self.shown.as_ref().map(|s| s.mode)
    }

    #[instrument(skip_all)]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> eyre::Result<()> {
        self.show_boot().await;
        tokio::select! {
            _ = tokio::time::sleep(self.settings.warmup) => {}
            _ = stopped(&mut shutdown) => return Ok(()),
        }

        let mut ticker = tokio::time::interval(self.settings.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Following {}", self.settings.player);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stopped(&mut shutdown) => break,
            }
            let outcome = self.tick().await;
            trace!(?outcome, "Tick finished");
        }
        info!("Display loop stopped");
        Ok(())
    }

    /// Polls the remote once and updates the screen if the mode changed.
    #[instrument(skip(self), level = "trace")]
    pub async fn tick(&mut self) -> TickOutcome {
        let brightness = self.poll_brightness().await;

        let observation = match self
            .remote
            .entity_state(&self.settings.player)
            .await
            .and_then(PlaybackObservation::try_from)
        {
            Ok(observation) => observation,
            Err(e) => {
                warn!(error = %e, "Unable to read player state, showing boot image");
                self.show_boot().await;
                return TickOutcome::FellBack;
            }
        };

        match classify(&observation) {
            DisplayMode::Cover => {
                let Some(artwork) = observation.artwork else {
                    trace!("Playing without artwork, keeping current image");
                    return TickOutcome::Unchanged;
                };
                let next = Shown {
                    mode: DisplayMode::Cover,
                    artwork: Some(artwork),
                };
                if self.shown.as_ref() == Some(&next) {
                    return TickOutcome::Unchanged;
                }
                self.show_cover(next, brightness).await
            }
            mode => {
                if self.current_mode() == Some(mode) {
                    return TickOutcome::Unchanged;
                }
                if self.show_static(mode, brightness).await {
                    TickOutcome::Rendered(mode)
                } else {
                    TickOutcome::Skipped(mode)
                }
            }
        }
    }

    async fn poll_brightness(&self) -> u8 {
        match self
            .remote
            .entity_state(&self.settings.brightness_entity)
            .await
        {
            Ok(entity) => parse_brightness(&entity.state).unwrap_or_else(|| {
                debug!("Brightness {:?} is not a number", entity.state);
                FULL_BRIGHTNESS
            }),
            Err(e) => {
                debug!(error = %e, "Brightness unavailable");
                FULL_BRIGHTNESS
            }
        }
    }

    async fn show_boot(&mut self) {
        self.show_static(DisplayMode::Boot, FULL_BRIGHTNESS).await;
    }

    /// Returns whether a frame reached the panel.
    async fn show_static(&mut self, mode: DisplayMode, brightness: u8) -> bool {
        let path = match mode {
            DisplayMode::Boot => self.settings.images.boot.clone(),
            DisplayMode::Idle => self.settings.images.idle.clone(),
            DisplayMode::Airplay => self.settings.images.airplay.clone(),
            DisplayMode::Cover => return false,
        };
        let shown = Shown {
            mode,
            artwork: None,
        };
        match load_asset(path, self.panel.size(), brightness).await {
            Ok(frame) => {
                let presented = self.present(&frame).await;
                if presented {
                    debug!("Showing {:?} at {}%", mode, brightness);
                    self.shown = Some(shown);
                }
                presented
            }
            Err(AssetError::NotFound(path)) => {
                debug!("No image at {:?}, skipping render", path);
                self.shown = Some(shown);
                false
            }
            Err(e) => {
                warn!(error = %e, "Unable to load {:?}", mode);
                self.shown = Some(shown);
                false
            }
        }
    }

    async fn show_cover(&mut self, next: Shown, brightness: u8) -> TickOutcome {
        let artwork = next.artwork.as_deref().unwrap_or_default();
        let frame = match self.remote.fetch(artwork).await {
            Ok(bytes) => decode_cover(bytes, self.panel.size(), brightness).await,
            Err(e) => {
                warn!(error = %e, "Unable to fetch cover art, showing boot image");
                self.show_boot().await;
                return TickOutcome::FellBack;
            }
        };
        match frame {
            Ok(frame) => {
                if !self.present(&frame).await {
                    return TickOutcome::Skipped(DisplayMode::Cover);
                }
                debug!("Showing cover {} at {}%", artwork, brightness);
                self.shown = Some(next);
                TickOutcome::Rendered(DisplayMode::Cover)
            }
            Err(e) => {
                warn!(error = %e, "Unable to decode cover art, showing boot image");
                self.show_boot().await;
                TickOutcome::FellBack
            }
        }
    }

    async fn present(&mut self, frame: &RgbImage) -> bool {
        match self.panel.show(frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Panel refused frame");
                false
            }
        }
    }
}

async fn load_asset(
    path: PathBuf,
    size: (u32, u32),
    brightness: u8,
) -> Result<RgbImage, AssetError> {
    tokio::task::spawn_blocking(move || -> Result<RgbImage, AssetError> {
        if !path.exists() {
            return Err(AssetError::NotFound(path));
        }
        let image = image::open(&path)?;
        Ok(frame::prepare(image, size, brightness))
    })
    .await?
}

async fn decode_cover(
    bytes: Vec<u8>,
    size: (u32, u32),
    brightness: u8,
) -> Result<RgbImage, AssetError> {
    tokio::task::spawn_blocking(move || -> Result<RgbImage, AssetError> {
        let image = image::load_from_memory(&bytes)?;
        Ok(frame::prepare(image, size, brightness))
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::tests::harness::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        remote: Arc<FakeRemote>,
        panel: RecordingPanel,
        renderer: DisplayRenderer<RecordingPanel, FakeRemote>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let images = write_image_set(dir.path());
        let remote = Arc::new(FakeRemote::default());
        let panel = RecordingPanel::new(8, 8);
        let settings = RendererSettings::new(
            Arc::new(PLAYER.to_owned()),
            Arc::new(BRIGHTNESS.to_owned()),
            images,
        );
        let renderer = DisplayRenderer::new(panel.clone(), remote.clone(), settings);
        Fixture {
            _dir: dir,
            remote,
            panel,
            renderer,
        }
    }

    fn observation(
        state: &str,
        source: Option<&str>,
        artwork: Option<&str>,
    ) -> PlaybackObservation {
        PlaybackObservation {
            state: state.to_owned(),
            source: source.map(str::to_owned),
            artwork: artwork.map(str::to_owned),
        }
    }

    #[test]
    fn airplay_overrides_state() {
        for state in ["playing", "paused", "off", "idle", "unavailable"] {
            for source in ["AirPlay", "airplay", "Kitchen AIRPLAY"] {
                assert_eq!(
                    classify(&observation(state, Some(source), Some("/a.jpg"))),
                    DisplayMode::Airplay
                );
            }
        }
    }

    #[test]
    fn anything_but_playing_is_idle() {
        for state in ["paused", "stopped", "off", "idle", "unknown", "Playing", ""] {
            assert_eq!(
                classify(&observation(state, Some("Spotify"), Some("/a.jpg"))),
                DisplayMode::Idle
            );
        }
        assert_eq!(classify(&observation("paused", None, None)), DisplayMode::Idle);
    }

    #[test]
    fn playing_without_airplay_is_cover() {
        assert_eq!(
            classify(&observation("playing", Some(""), Some("/local/cover.jpg"))),
            DisplayMode::Cover
        );
        assert_eq!(classify(&observation("playing", None, None)), DisplayMode::Cover);
    }

    #[test]
    fn brightness_parsing() {
        assert_eq!(parse_brightness("40.0"), Some(40));
        assert_eq!(parse_brightness("72.9"), Some(72));
        assert_eq!(parse_brightness(" 100 "), Some(100));
        assert_eq!(parse_brightness("250"), Some(100));
        assert_eq!(parse_brightness("-5"), Some(0));
        assert_eq!(parse_brightness("unavailable"), None);
        assert_eq!(parse_brightness("NaN"), None);
    }

    #[tokio::test]
    async fn playing_with_artwork_renders_cover() {
        let mut f = fixture();
        f.remote.set_brightness("40");
        f.remote.set_state(
            PLAYER,
            "playing",
            json!({ "source": "", "entity_picture": "/local/cover.jpg" }),
        );
        f.remote
            .set_artwork("http://ha.test:8123/local/cover.jpg", solid_png(COVER_COLOR));

        assert_eq!(f.renderer.tick().await, TickOutcome::Rendered(DisplayMode::Cover));
        assert_eq!(f.renderer.current_mode(), Some(DisplayMode::Cover));
        assert_eq!(f.remote.fetches(), vec!["http://ha.test:8123/local/cover.jpg"]);
        assert_color_near(f.panel.last_color(), scaled(COVER_COLOR, 0.4));
        assert_eq!(f.panel.frames()[0].dimensions(), (8, 8));
    }

    #[tokio::test]
    async fn same_artwork_is_not_rendered_twice() {
        let mut f = fixture();
        f.remote.set_brightness("100");
        f.remote
            .set_state(PLAYER, "playing", json!({ "entity_picture": "/local/a.jpg" }));
        f.remote
            .set_artwork("http://ha.test:8123/local/a.jpg", solid_png(COVER_COLOR));
        f.remote
            .set_artwork("http://ha.test:8123/local/b.jpg", solid_png(IDLE_COLOR));

        f.renderer.tick().await;
        assert_eq!(f.renderer.tick().await, TickOutcome::Unchanged);
        assert_eq!(f.panel.render_count(), 1);

        f.remote
            .set_state(PLAYER, "playing", json!({ "entity_picture": "/local/b.jpg" }));
        assert_eq!(f.renderer.tick().await, TickOutcome::Rendered(DisplayMode::Cover));
        assert_eq!(f.panel.render_count(), 2);
    }

    #[tokio::test]
    async fn paused_renders_idle_once() {
        let mut f = fixture();
        f.remote.set_brightness("100");
        f.remote.set_state(PLAYER, "paused", json!({}));

        assert_eq!(f.renderer.tick().await, TickOutcome::Rendered(DisplayMode::Idle));
        assert_color_near(f.panel.last_color(), IDLE_COLOR);
        assert_eq!(f.renderer.tick().await, TickOutcome::Unchanged);
        assert_eq!(f.panel.render_count(), 1);
    }

    #[tokio::test]
    async fn idle_follows_cover_at_current_brightness() {
        let mut f = fixture();
        f.remote.set_brightness("50");
        f.remote
            .set_state(PLAYER, "playing", json!({ "entity_picture": "/local/a.jpg" }));
        f.remote
            .set_artwork("http://ha.test:8123/local/a.jpg", solid_png(COVER_COLOR));
        f.renderer.tick().await;

        f.remote.set_state(PLAYER, "paused", json!({}));
        assert_eq!(f.renderer.tick().await, TickOutcome::Rendered(DisplayMode::Idle));
        assert_color_near(f.panel.last_color(), scaled(IDLE_COLOR, 0.5));
    }

    #[tokio::test]
    async fn airplay_source_renders_airplay() {
        let mut f = fixture();
        f.remote.set_brightness("100");
        f.remote.set_state(
            PLAYER,
            "playing",
            json!({ "source": "AirPlay", "entity_picture": "/local/a.jpg" }),
        );

        assert_eq!(
            f.renderer.tick().await,
            TickOutcome::Rendered(DisplayMode::Airplay)
        );
        assert_color_near(f.panel.last_color(), AIRPLAY_COLOR);
        assert!(f.remote.fetches().is_empty());
    }

    #[tokio::test]
    async fn state_failure_falls_back_to_full_brightness_boot() {
        let mut f = fixture();
        f.remote.set_brightness("10");
        f.remote.set_state(PLAYER, "paused", json!({}));
        f.renderer.tick().await;

        f.remote
            .fail_state(PLAYER, reqwest::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(f.renderer.tick().await, TickOutcome::FellBack);
        assert_eq!(f.renderer.current_mode(), Some(DisplayMode::Boot));
        assert_color_near(f.panel.last_color(), BOOT_COLOR);

        // Boot is re-rendered on every failing tick.
        assert_eq!(f.renderer.tick().await, TickOutcome::FellBack);
        assert_eq!(f.panel.render_count(), 3);
    }

    #[tokio::test]
    async fn missing_brightness_means_full() {
        let mut f = fixture();
        f.remote.set_state(PLAYER, "off", json!({}));
        f.renderer.tick().await;
        assert_color_near(f.panel.last_color(), IDLE_COLOR);
    }

    #[tokio::test]
    async fn zero_brightness_is_dimmed_not_black() {
        let mut f = fixture();
        f.remote.set_brightness("0");
        f.remote.set_state(PLAYER, "idle", json!({}));
        f.renderer.tick().await;
        assert_color_near(f.panel.last_color(), scaled(IDLE_COLOR, 0.05));
    }

    #[tokio::test]
    async fn playing_without_artwork_keeps_current_image() {
        let mut f = fixture();
        f.remote.set_brightness("100");
        f.remote.set_state(PLAYER, "paused", json!({}));
        f.renderer.tick().await;

        f.remote.set_state(PLAYER, "playing", json!({}));
        assert_eq!(f.renderer.tick().await, TickOutcome::Unchanged);
        assert_eq!(f.renderer.current_mode(), Some(DisplayMode::Idle));
        assert_eq!(f.panel.render_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_artwork_falls_back_to_boot() {
        let mut f = fixture();
        f.remote.set_brightness("100");
        f.remote
            .set_state(PLAYER, "playing", json!({ "entity_picture": "/local/gone.jpg" }));

        assert_eq!(f.renderer.tick().await, TickOutcome::FellBack);
        assert_eq!(f.renderer.current_mode(), Some(DisplayMode::Boot));
        assert_color_near(f.panel.last_color(), BOOT_COLOR);
    }

    #[tokio::test]
    async fn missing_asset_skips_render_but_tracks_mode() {
        let mut f = fixture();
        std::fs::remove_file(&f.renderer.settings.images.idle).unwrap();
        f.remote.set_brightness("100");
        f.remote.set_state(PLAYER, "paused", json!({}));

        assert_eq!(f.renderer.tick().await, TickOutcome::Skipped(DisplayMode::Idle));
        assert_eq!(f.panel.render_count(), 0);
        assert_eq!(f.renderer.current_mode(), Some(DisplayMode::Idle));

        // The mode is already current, so the next tick does not retry.
        assert_eq!(f.renderer.tick().await, TickOutcome::Unchanged);
    }

    #[tokio::test]
    async fn refused_frame_is_retried_next_tick() {
        let mut f = fixture();
        f.remote.set_brightness("100");
        f.remote.set_state(PLAYER, "paused", json!({}));
        f.panel.refuse_frames(true);

        assert_eq!(f.renderer.tick().await, TickOutcome::Skipped(DisplayMode::Idle));
        assert_eq!(f.renderer.current_mode(), None);

        f.panel.refuse_frames(false);
        assert_eq!(f.renderer.tick().await, TickOutcome::Rendered(DisplayMode::Idle));
        assert_eq!(f.panel.render_count(), 1);
    }

    #[tokio::test]
    async fn player_without_attributes_falls_back_to_boot() {
        let mut f = fixture();
        f.remote.set_brightness("30");
        f.remote.set_state(PLAYER, "paused", json!({}));
        f.renderer.tick().await;

        f.remote.set_body(PLAYER, json!({ "state": "playing" }));
        assert_eq!(f.renderer.tick().await, TickOutcome::FellBack);
        assert_eq!(f.renderer.current_mode(), Some(DisplayMode::Boot));
        assert_color_near(f.panel.last_color(), BOOT_COLOR);
    }

    #[tokio::test]
    async fn null_source_falls_back_to_boot() {
        let mut f = fixture();
        f.remote.set_brightness("100");
        f.remote.set_state(
            PLAYER,
            "playing",
            json!({ "source": null, "entity_picture": "/local/a.jpg" }),
        );
        f.remote
            .set_artwork("http://ha.test:8123/local/a.jpg", solid_png(COVER_COLOR));

        assert_eq!(f.renderer.tick().await, TickOutcome::FellBack);
        assert!(f.remote.fetches().is_empty());
        assert_color_near(f.panel.last_color(), BOOT_COLOR);
    }

    #[tokio::test]
    async fn absolute_artwork_urls_are_used_verbatim() {
        let mut f = fixture();
        f.remote.set_brightness("100");
        f.remote.set_state(
            PLAYER,
            "playing",
            json!({ "entity_picture": "https://cdn.test/art.png" }),
        );
        f.remote
            .set_artwork("https://cdn.test/art.png", solid_png(COVER_COLOR));

        assert_matches!(f.renderer.tick().await, TickOutcome::Rendered(DisplayMode::Cover));
        assert_eq!(f.remote.fetches(), vec!["https://cdn.test/art.png"]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_shows_boot_then_follows_player() {
        let f = fixture();
        f.remote.set_brightness("100");
        f.remote.set_state(PLAYER, "paused", json!({}));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let panel = f.panel.clone();
        let task = tokio::spawn(f.renderer.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(panel.render_count(), 1);
        assert_color_near(panel.last_color(), BOOT_COLOR);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(panel.render_count(), 2);
        assert_color_near(panel.last_color(), IDLE_COLOR);

        shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();
    }
}
