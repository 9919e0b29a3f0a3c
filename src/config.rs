use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

/// Application configuration loaded from TOML config file.
/// Every field has a default, so the config file is optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory chord listings are exported to.
    pub export_dir: PathBuf,
    /// Custom analysis cache path (overrides XDG default).
    pub cache_path: Option<PathBuf>,
    /// Reuse cached analysis for unchanged files.
    pub use_cache: bool,
    /// Number of parallel workers for batch export. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    pub playback: PlaybackConfig,
    pub separation: SeparationConfig,
    /// Chord recognizer. Prints a `.lab`, JSON or JAMS timeline on stdout.
    pub chords: ToolConfig,
    /// Key detector. Prints the key label on stdout.
    pub key: ToolConfig,
    /// Tempo estimator. Prints the BPM on stdout.
    pub tempo: ToolConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            export_dir: PathBuf::from("export"),
            cache_path: None,
            use_cache: true,
            workers: 0,
            playback: PlaybackConfig::default(),
            separation: SeparationConfig::default(),
            chords: ToolConfig::default(),
            key: ToolConfig::default(),
            tempo: ToolConfig::default(),
        }
    }
}

/// Playback timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Position poll interval while playing.
    pub tick_interval_ms: u64,
    /// Relative seek step for forward/back.
    pub seek_step_ms: u64,
    /// Start playing as soon as the chord timeline arrives.
    pub auto_play: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            seek_step_ms: 10_000,
            auto_play: true,
        }
    }
}

/// An external analysis tool. `{input}` and `{out_dir}` in `args` are
/// substituted before running. An empty `program` means not configured.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolConfig {
    pub fn is_configured(&self) -> bool {
        !self.program.trim().is_empty()
    }
}

/// Source separation (Demucs by default).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SeparationConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Stem file name (without extension) to keep from the separator output.
    pub stem: String,
    /// Where isolated stems are moved. Defaults to the XDG data dir.
    pub output_dir: Option<PathBuf>,
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: ["-m", "demucs", "--out", "{out_dir}", "{input}"]
                .map(String::from)
                .to_vec(),
            stem: "other".to_string(),
            output_dir: None,
        }
    }
}

impl SeparationConfig {
    pub fn tool(&self) -> ToolConfig {
        ToolConfig {
            program: self.program.clone(),
            args: self.args.clone(),
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/chordsync/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    pub fn resolve_cache_path(&self) -> PathBuf {
        self.cache_path.clone().unwrap_or_else(default_cache_path)
    }

    pub fn resolve_stems_dir(&self) -> PathBuf {
        self.separation
            .output_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("stems"))
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

fn data_dir() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.to_path_buf()
    } else {
        // Fallback: current directory
        PathBuf::from(".")
    }
}

/// Resolve the default cache database path using XDG data directory.
pub fn default_cache_path() -> PathBuf {
    data_dir().join("chordsync.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.playback.tick_interval_ms, 100);
        assert_eq!(config.playback.seek_step_ms, 10_000);
        assert!(config.playback.auto_play);
        assert!(config.use_cache);
        assert!(config.separation.tool().is_configured());
        assert!(!config.chords.is_configured());
        assert!(config.resolve_workers() >= 1);
    }

    #[test]
    fn test_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            export_dir = "/tmp/chords"
            workers = 3

            [playback]
            seek_step_ms = 5000

            [separation]
            program = "demucs"
            args = ["-n", "htdemucs_6s", "-o", "{out_dir}", "{input}"]
            stem = "guitar"

            [chords]
            program = "chord-extractor"
            args = ["{input}"]
            "#,
        )
        .unwrap();

        assert_eq!(config.export_dir, PathBuf::from("/tmp/chords"));
        assert_eq!(config.resolve_workers(), 3);
        assert_eq!(config.playback.seek_step_ms, 5000);
        assert_eq!(config.playback.tick_interval_ms, 100);
        assert_eq!(config.separation.program, "demucs");
        assert_eq!(config.separation.stem, "guitar");
        assert_eq!(config.chords.args, vec!["{input}"]);
        assert!(!config.key.is_configured());
    }

    #[test]
    fn test_separation_keeps_default_tool() {
        let config: AppConfig = toml::from_str("[separation]\nstem = \"guitar\"\n").unwrap();
        assert_eq!(config.separation.program, "python3");
        assert_eq!(config.separation.stem, "guitar");
    }
}
