pub mod batch;
pub mod cache;
pub mod config;
pub mod export;
pub mod jobs;
pub mod metadata;
pub mod playback;
pub mod render;
pub mod timeline;
pub mod tracker;

pub use playback::{PlaybackController, PlaybackState};
pub use timeline::{ChordSegment, ChordTimeline};
pub use tracker::{PositionTracker, ResolvedView};

/// Audio file extensions we support
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "wav", "mp3", "m4a", "aac", "flac", "ogg",
];

/// Application name for XDG paths
pub const APP_NAME: &str = "chordsync";
