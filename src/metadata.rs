use lofty::file::TaggedFileExt;
use lofty::prelude::*;
use std::path::Path;

/// What we know about a track before analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    /// Tag title, or the file name without extension.
    pub title: String,
    pub artist: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Read tags from an audio file. Falls back to the file stem on failure.
pub fn read_track_info(path: &Path) -> TrackInfo {
    let fallback_title = title_from_path(path);

    let tagged_file = match lofty::read_from_path(path) {
        Ok(f) => f,
        Err(e) => {
            log::debug!("Could not read tags from {}: {}", path.display(), e);
            return TrackInfo {
                title: fallback_title,
                artist: None,
                duration_ms: None,
            };
        }
    };

    let duration_ms = {
        let ms = tagged_file.properties().duration().as_millis() as u64;
        if ms > 0 { Some(ms) } else { None }
    };

    // Try primary tag, then fall back
    let tag = tagged_file
        .primary_tag()
        .or_else(|| tagged_file.first_tag());

    TrackInfo {
        title: tag
            .and_then(|t| t.title().map(|s| s.trim().to_string()))
            .filter(|s| !s.is_empty())
            .unwrap_or(fallback_title),
        artist: tag.and_then(|t| t.artist().map(|s| s.to_string())),
        duration_ms,
    }
}

/// `/music/My Song.final.mp3` → `My Song.final`.
pub fn title_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "untitled".to_string())
}

/// `M:SS` position label.
pub fn format_clock(ms: u64) -> String {
    format!("{}:{:02}", ms / 60_000, (ms % 60_000) / 1000)
}
