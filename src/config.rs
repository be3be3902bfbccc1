use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

const DEFAULT_MEDIA_PLAYER: &str = "media_player.pirate_audio";
const DEFAULT_BRIGHTNESS_ENTITY: &str = "input_number.pirate_brightness";
const DEFAULT_IMG_DIR: &str = "/home/raspberry/images";
const DEFAULT_BUTTONS: &str = "5:media_play_pause,6:media_next_track,16:volume_up,24:volume_down";
const DEFAULT_FRAMEBUFFER: &str = "/dev/fb1";
const DEFAULT_BACKLIGHT_PIN: u8 = 13;
const DEFAULT_ROTATION: u16 = 90;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path:?}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
    #[error("malformed config line")]
    Malformed(#[source] dotenvy::Error),
    #[error("required key {0} is missing or empty")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("invalid button binding {0:?}, expected <line>:<command>")]
    Binding(String),
    #[error("line {0} is bound more than once")]
    DuplicateLine(u8),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub remote: RemoteConfig,
    pub player: Arc<String>,
    pub brightness_entity: Arc<String>,
    pub images: ImageSet,
    pub bindings: Arc<[InputBinding]>,
    pub panel: PanelConfig,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub token: String,
}

/// Static images shown for the non-cover display modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSet {
    pub boot: PathBuf,
    pub idle: PathBuf,
    pub airplay: PathBuf,
}

impl ImageSet {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        ImageSet {
            boot: dir.join("boot.png"),
            idle: dir.join("idle.png"),
            airplay: dir.join("airplay.png"),
        }
    }
}

/// One physical button: the GPIO line it shorts to ground and the media
/// player service it triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBinding {
    pub line: u8,
    pub command: Arc<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelConfig {
    pub framebuffer: PathBuf,
    pub backlight_pin: u8,
    pub rotation: u16,
}

impl Config {
    #[tracing::instrument(level = "debug")]
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let entries = dotenvy::from_path_iter(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_owned(),
            source,
        })?;
        Self::from_entries(entries)
    }

    fn from_entries<I>(entries: I) -> Result<Config, ConfigError>
    where
        I: IntoIterator<Item = Result<(String, String), dotenvy::Error>>,
    {
        let mut values = HashMap::new();
        for entry in entries {
            let (key, value) = entry.map_err(ConfigError::Malformed)?;
            values.insert(key, value.trim().to_owned());
        }
        let get = |key: &str| values.get(key).map(String::as_str).filter(|v| !v.is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let remote = RemoteConfig {
            base_url: required("HA_URL")?.trim_end_matches('/').to_owned(),
            token: required("HA_TOKEN")?.to_owned(),
        };

        let backlight_pin = match get("BACKLIGHT_PIN") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                key: "BACKLIGHT_PIN",
                value: v.to_owned(),
            })?,
            None => DEFAULT_BACKLIGHT_PIN,
        };
        let rotation = match get("DISPLAY_ROTATION") {
            Some(v) => match v.parse() {
                Ok(r @ (0 | 90 | 180 | 270)) => r,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "DISPLAY_ROTATION",
                        value: v.to_owned(),
                    });
                }
            },
            None => DEFAULT_ROTATION,
        };

        Ok(Config {
            remote,
            player: Arc::new(get("MEDIA_PLAYER").unwrap_or(DEFAULT_MEDIA_PLAYER).to_owned()),
            brightness_entity: Arc::new(
                get("BRIGHTNESS_ENTITY")
                    .unwrap_or(DEFAULT_BRIGHTNESS_ENTITY)
                    .to_owned(),
            ),
            images: ImageSet::in_dir(get("IMG_DIR").unwrap_or(DEFAULT_IMG_DIR)),
            bindings: parse_bindings(get("BUTTONS").unwrap_or(DEFAULT_BUTTONS))?.into(),
            panel: PanelConfig {
                framebuffer: PathBuf::from(get("FRAMEBUFFER").unwrap_or(DEFAULT_FRAMEBUFFER)),
                backlight_pin,
                rotation,
            },
        })
    }
}

fn parse_bindings(list: &str) -> Result<Vec<InputBinding>, ConfigError> {
    let mut bindings: Vec<InputBinding> = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (line, command) = part
            .split_once(':')
            .ok_or_else(|| ConfigError::Binding(part.to_owned()))?;
        let line: u8 = line
            .trim()
            .parse()
            .map_err(|_| ConfigError::Binding(part.to_owned()))?;
        let command = command.trim();
        if command.is_empty() {
            return Err(ConfigError::Binding(part.to_owned()));
        }
        if bindings.iter().any(|b| b.line == line) {
            return Err(ConfigError::DuplicateLine(line));
        }
        bindings.push(InputBinding {
            line,
            command: Arc::new(command.to_owned()),
        });
    }
    if bindings.is_empty() {
        return Err(ConfigError::Missing("BUTTONS"));
    }
    Ok(bindings)
}
