use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::timeline::ChordTimeline;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Nothing to export: chord timeline is empty")]
    EmptyTimeline,
    #[error("IO error writing {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// Format seconds as `MM:SS`, or `HH:MM:SS` once the hour is reached.
/// The total is rounded to the nearest second before splitting.
pub fn format_time(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (hours, minutes, secs) = (total / 3600, (total / 60) % 60, total % 60);
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

/// One `(start - end): label` line per segment.
pub fn render_listing(timeline: &ChordTimeline) -> String {
    let mut out = String::new();
    for seg in timeline {
        let _ = writeln!(
            out,
            "({} - {}): {}",
            format_time(seg.start),
            format_time(seg.end),
            seg.label
        );
    }
    out
}

/// Write the listing to `<dir>/<name>.txt`, creating `dir` if needed.
pub fn write_listing(
    timeline: &ChordTimeline,
    dir: &Path,
    name: &str,
) -> Result<PathBuf, ExportError> {
    if timeline.is_empty() {
        return Err(ExportError::EmptyTimeline);
    }
    let io_err = |path: &Path| {
        let path = path.display().to_string();
        move |source| ExportError::Io { path, source }
    };

    std::fs::create_dir_all(dir).map_err(io_err(dir))?;
    let path = dir.join(format!("{}.txt", sanitize_name(name)));
    std::fs::write(&path, render_listing(timeline)).map_err(io_err(&path))?;

    log::info!("Exported {} chords to {}", timeline.len(), path.display());
    Ok(path)
}

/// File-system safe listing name; blank names become `chords`.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        "chords".to_string()
    } else {
        cleaned.to_string()
    }
}
