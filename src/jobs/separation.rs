use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};

use walkdir::WalkDir;

use super::command::run_tool;
use super::{JobError, JobKind};
use crate::config::ToolConfig;

static RUN: AtomicU64 = AtomicU64::new(0);

/// Isolates one instrument stem with an external separator.
///
/// Demucs writes `<out>/<model>/<track>/<stem>.wav`; the model folder depends
/// on which model ran, so the stem is located by walking the output tree.
pub struct Separator {
    tool: ToolConfig,
    stem: String,
    stems_dir: PathBuf,
}

impl Separator {
    pub fn new(tool: ToolConfig, stem: &str, stems_dir: PathBuf) -> Self {
        Self {
            tool,
            stem: stem.to_string(),
            stems_dir,
        }
    }

    /// Run the separator and move the stem to `<stems_dir>/<track>_<stem>.<ext>`.
    pub fn isolate(&self, input: &Path) -> Result<PathBuf, JobError> {
        let base_name = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "track".to_string());

        let work_dir = std::env::temp_dir().join(format!(
            "chordsync_sep_{}_{}_{}",
            base_name,
            std::process::id(),
            RUN.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&work_dir)?;

        let result = run_tool(JobKind::Separation, &self.tool, input, Some(&work_dir))
            .and_then(|_| {
                find_stem(&work_dir, &base_name, &self.stem).ok_or_else(|| {
                    JobError::MissingArtifact(format!(
                        "'{}' stem for {} under {}",
                        self.stem,
                        base_name,
                        work_dir.display()
                    ))
                })
            })
            .and_then(|found| {
                let ext = found.extension().and_then(|e| e.to_str()).unwrap_or("wav");
                std::fs::create_dir_all(&self.stems_dir)?;
                let dest = self
                    .stems_dir
                    .join(format!("{}_{}.{}", base_name, self.stem, ext));
                move_file(&found, &dest)?;
                Ok(dest)
            });

        // Clean up temp output
        std::fs::remove_dir_all(&work_dir).ok();

        if let Ok(dest) = &result {
            log::info!("Isolated {} stem saved at {}", self.stem, dest.display());
        }
        result
    }
}

/// Find `<stem>.*` inside a directory named after the track, falling back to
/// the first `<stem>.*` anywhere under `root`.
fn find_stem(root: &Path, base_name: &str, stem: &str) -> Option<PathBuf> {
    let candidates: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().file_stem().and_then(|s| s.to_str()) == Some(stem))
        .map(|e| e.into_path())
        .collect();

    let in_track_dir = candidates.iter().find(|p| {
        p.parent()
            .and_then(|d| d.file_name())
            .and_then(|n| n.to_str())
            == Some(base_name)
    });
    in_track_dir.or(candidates.first()).cloned()
}

/// Rename, falling back to copy + delete across filesystems.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)?;
    std::fs::remove_file(from).ok();
    Ok(())
}

/// Human-readable process status, e.g. `exit code 1`.
pub fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "termination by signal".to_string(),
    }
}
