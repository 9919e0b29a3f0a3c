use std::collections::HashSet;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use walkdir::WalkDir;

use crate::cache::{AnalysisCache, FileStamp};
use crate::export;
use crate::jobs::{self, AnalysisBackend, JobError, JobKind, JobPayload};
use crate::metadata;
use crate::timeline::ChordTimeline;
use crate::SUPPORTED_EXTENSIONS;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Could not build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

pub struct BatchResult {
    pub exported: u64,
    pub cached: u64,
    pub failed: u64,
}

/// Audio files under `root`, sorted by path.
pub fn collect_audio_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let ext = e
                .path()
                .extension()
                .and_then(|x| x.to_str())
                .unwrap_or("")
                .to_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        })
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

struct Recognized {
    path: PathBuf,
    title: String,
    stamp: Option<FileStamp>,
    from_cache: bool,
    outcome: Result<ChordTimeline, JobError>,
}

fn cached_chords(cache: Option<&AnalysisCache>, stamp: Option<&FileStamp>) -> Option<ChordTimeline> {
    let (cache, stamp) = (cache?, stamp?);
    match cache.lookup(stamp) {
        Ok(hit) => hit.and_then(|c| c.chords),
        Err(e) => {
            log::warn!("Cache lookup failed for {}: {}", stamp.path, e);
            None
        }
    }
}

/// Listing name for `title`, suffixed ` (2)`, ` (3)`, ... when an earlier
/// file in the same run already took it. Case-insensitive.
fn unique_name(title: &str, taken: &mut HashSet<String>) -> String {
    let base = export::sanitize_name(title);
    let mut name = base.clone();
    let mut n = 1;
    while !taken.insert(name.to_lowercase()) {
        n += 1;
        name = format!("{base} ({n})");
    }
    name
}

/// Chord recognition for one file, unwrapped from its payload.
pub fn recognize(backend: &dyn AnalysisBackend, path: &Path) -> Result<ChordTimeline, JobError> {
    match jobs::run_job(backend, JobKind::Chords, path)? {
        JobPayload::Chords(timeline) => Ok(timeline),
        _ => Err(JobError::BadOutput {
            kind: JobKind::Chords,
            message: "unexpected payload".to_string(),
        }),
    }
}

/// Recognize chords for every audio file under `root` and write one listing
/// per file into `out_dir`. Per-file failures are counted, never fatal.
pub fn export_directory(
    backend: &dyn AnalysisBackend,
    cache: Option<&AnalysisCache>,
    root: &Path,
    out_dir: &Path,
    jobs: usize,
) -> Result<BatchResult, BatchError> {
    let files = collect_audio_files(root);
    let mut result = BatchResult {
        exported: 0,
        cached: 0,
        failed: 0,
    };

    if files.is_empty() {
        log::info!("No audio files under {}", root.display());
        return Ok(result);
    }

    let jobs = jobs.max(1);
    log::info!("Exporting chords for {} files with {} workers", files.len(), jobs);

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;
    let mut taken = HashSet::new();

    // Cache lookups and writes stay on this thread; only recognition runs
    // on the pool.
    for chunk in files.chunks(jobs * 2) {
        let pending: Vec<(PathBuf, Option<FileStamp>, Option<ChordTimeline>)> = chunk
            .iter()
            .map(|path| {
                let stamp = FileStamp::of(path).ok();
                let hit = cached_chords(cache, stamp.as_ref());
                (path.clone(), stamp, hit)
            })
            .collect();

        let recognized: Vec<Recognized> = pool.install(|| {
            use rayon::prelude::*;
            pending
                .into_par_iter()
                .map(|(path, stamp, hit)| {
                    let title = metadata::read_track_info(&path).title;
                    let from_cache = hit.is_some();
                    let outcome = match hit {
                        Some(timeline) => Ok(timeline),
                        None => recognize(backend, &path),
                    };
                    pb.inc(1);
                    Recognized {
                        path,
                        title,
                        stamp,
                        from_cache,
                        outcome,
                    }
                })
                .collect()
        });

        for item in recognized {
            let timeline = match item.outcome {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("Chord recognition failed for {}: {}", item.path.display(), e);
                    result.failed += 1;
                    continue;
                }
            };

            if !item.from_cache {
                if let (Some(cache), Some(stamp)) = (cache, item.stamp.as_ref()) {
                    if let Err(e) = cache.record(stamp, &JobPayload::Chords(timeline.clone())) {
                        log::warn!("Could not cache chords for {}: {}", item.path.display(), e);
                    }
                }
            } else {
                result.cached += 1;
            }

            let name = unique_name(&item.title, &mut taken);
            match export::write_listing(&timeline, out_dir, &name) {
                Ok(path) => {
                    log::debug!("{} -> {}", item.path.display(), path.display());
                    result.exported += 1;
                }
                Err(e) => {
                    log::warn!("Export failed for {}: {}", item.path.display(), e);
                    result.failed += 1;
                }
            }
        }
    }

    pb.finish_with_message("done");
    log::info!(
        "Batch export complete: {} exported ({} from cache), {} failed",
        result.exported,
        result.cached,
        result.failed
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::FakeBackend;
    use tempfile::tempdir;

    fn timeline() -> ChordTimeline {
        ChordTimeline::from_triples([(0.0, 65.0, "C"), (65.0, 130.0, "G")])
    }

    #[test]
    fn test_collect_audio_files_filters_extensions() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        std::fs::create_dir_all(dir.join("live")).unwrap();
        std::fs::write(dir.join("b.mp3"), b"x").unwrap();
        std::fs::write(dir.join("live/a.FLAC"), b"x").unwrap();
        std::fs::write(dir.join("notes.txt"), b"x").unwrap();

        let files = collect_audio_files(dir);
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| p.extension().unwrap() != "txt"));
    }

    #[test]
    fn test_export_directory_counts_and_writes() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let out = dir.join("out");
        std::fs::write(dir.join("one.wav"), b"RIFF").unwrap();
        std::fs::write(dir.join("two.wav"), b"RIFF").unwrap();

        let backend = FakeBackend::ok(timeline());
        let result = export_directory(&backend, None, dir, &out, 2).unwrap();
        assert_eq!(result.exported, 2);
        assert_eq!(result.failed, 0);

        let listing = std::fs::read_to_string(out.join("one.txt")).unwrap();
        assert_eq!(listing, "(00:00 - 01:05): C\n(01:05 - 02:10): G\n");
    }

    #[test]
    fn test_same_title_gets_distinct_listing() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let out = dir.join("out");
        for sub in ["early", "late"] {
            std::fs::create_dir_all(dir.join(sub)).unwrap();
            std::fs::write(dir.join(sub).join("Jam.wav"), b"RIFF").unwrap();
        }
        std::fs::write(dir.join("jam.mp3"), b"RIFF").unwrap();

        let backend = FakeBackend::ok(timeline());
        let result = export_directory(&backend, None, dir, &out, 2).unwrap();
        assert_eq!(result.exported, 3);

        // Walk order: early/Jam.wav, jam.mp3, late/Jam.wav
        let mut names: Vec<String> = std::fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, ["Jam (3).txt", "Jam.txt", "jam (2).txt"]);
    }

    #[test]
    fn test_unique_name() {
        let mut taken = HashSet::new();
        assert_eq!(unique_name("Song", &mut taken), "Song");
        assert_eq!(unique_name("song", &mut taken), "song (2)");
        assert_eq!(unique_name("Song", &mut taken), "Song (3)");
        assert_eq!(unique_name("A/B", &mut taken), "A_B");
        assert_eq!(unique_name("", &mut taken), "chords");
    }

    #[test]
    fn test_failures_are_counted_not_fatal() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        std::fs::write(dir.join("bad.wav"), b"RIFF").unwrap();

        let mut backend = FakeBackend::ok(timeline());
        backend.chords = Err("recognizer crashed".into());
        let result = export_directory(&backend, None, dir, &dir.join("out"), 1).unwrap();
        assert_eq!(result.exported, 0);
        assert_eq!(result.failed, 1);

        // Empty timelines can't be exported either
        backend.chords = Ok(ChordTimeline::default());
        let result = export_directory(&backend, None, dir, &dir.join("out"), 1).unwrap();
        assert_eq!(result.failed, 1);
    }

    #[test]
    fn test_second_run_uses_cache() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        std::fs::write(dir.join("song.wav"), b"RIFF").unwrap();
        let cache = AnalysisCache::open_in_memory().unwrap();

        let backend = FakeBackend::ok(timeline());
        let first = export_directory(&backend, Some(&cache), dir, &dir.join("out"), 1).unwrap();
        assert_eq!((first.exported, first.cached), (1, 0));

        let mut broken = FakeBackend::ok(timeline());
        broken.chords = Err("should not run".into());
        let second = export_directory(&broken, Some(&cache), dir, &dir.join("out"), 1).unwrap();
        assert_eq!((second.exported, second.cached, second.failed), (1, 1, 0));
    }

    #[test]
    fn test_empty_directory() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let backend = FakeBackend::ok(timeline());
        let result = export_directory(&backend, None, dir, &dir.join("out"), 0).unwrap();
        assert_eq!((result.exported, result.failed), (0, 0));
    }
}
