pub mod command;
pub mod separation;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::timeline::{ChordTimeline, TimelineError};

/// Identity of one track load. Results tagged with an older id are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(u64);

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

impl TrackId {
    pub fn next() -> Self {
        Self(NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Separation,
    Chords,
    Key,
    Tempo,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Separation,
        JobKind::Chords,
        JobKind::Key,
        JobKind::Tempo,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Separation => "separation",
            Self::Chords => "chord recognition",
            Self::Key => "key detection",
            Self::Tempo => "tempo detection",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Input file not found: {0}")]
    MissingInput(String),
    #[error("No tool configured for {0}")]
    NotConfigured(JobKind),
    #[error("{0} not found. Is it installed and on PATH?")]
    ToolNotFound(String),
    #[error("{tool} failed with {status}:\n{log}")]
    ToolFailed {
        tool: String,
        status: String,
        log: String,
    },
    #[error("Could not find expected output {0}")]
    MissingArtifact(String),
    #[error("Unusable {kind} output: {message}")]
    BadOutput { kind: JobKind, message: String },
    #[error("Timeline error: {0}")]
    Timeline(#[from] TimelineError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} job panicked")]
    Panicked(JobKind),
}

/// Typed result of a successful job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    Stem(PathBuf),
    Chords(ChordTimeline),
    Key(String),
    Tempo(f64),
}

/// Terminal outcome of one job, tagged with the track it was launched for.
#[derive(Debug)]
pub struct JobEvent {
    pub track: TrackId,
    pub kind: JobKind,
    pub outcome: Result<JobPayload, JobError>,
    pub elapsed: Duration,
}

pub type JobSender = UnboundedSender<JobEvent>;
pub type JobReceiver = UnboundedReceiver<JobEvent>;

pub fn job_channel() -> (JobSender, JobReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

/// The external analysis collaborators. Each call blocks until the tool is done.
pub trait AnalysisBackend: Send + Sync {
    fn separate(&self, input: &Path) -> Result<PathBuf, JobError>;
    fn recognize_chords(&self, input: &Path) -> Result<ChordTimeline, JobError>;
    fn detect_key(&self, input: &Path) -> Result<String, JobError>;
    fn detect_tempo(&self, input: &Path) -> Result<f64, JobError>;
}

/// Run one job synchronously on the calling thread.
pub fn run_job(
    backend: &dyn AnalysisBackend,
    kind: JobKind,
    input: &Path,
) -> Result<JobPayload, JobError> {
    if !input.is_file() {
        return Err(JobError::MissingInput(input.display().to_string()));
    }
    match kind {
        JobKind::Separation => backend.separate(input).map(JobPayload::Stem),
        JobKind::Chords => backend.recognize_chords(input).map(JobPayload::Chords),
        JobKind::Key => backend.detect_key(input).map(JobPayload::Key),
        JobKind::Tempo => backend.detect_tempo(input).map(JobPayload::Tempo),
    }
}

/// Launch each job on its own worker thread. Every job sends exactly one
/// [`JobEvent`] on `tx`, including when it panics or the thread can't start.
pub fn dispatch(
    backend: Arc<dyn AnalysisBackend>,
    track: TrackId,
    input: &Path,
    kinds: &[JobKind],
    tx: &JobSender,
) {
    for &kind in kinds {
        let backend = Arc::clone(&backend);
        let input = input.to_path_buf();
        let worker_tx = tx.clone();

        log::info!("Dispatching {} for track {} ({})", kind, track, input.display());

        let spawned = std::thread::Builder::new()
            .name(format!("job-{kind:?}").to_lowercase())
            .spawn(move || {
                let started = Instant::now();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    run_job(backend.as_ref(), kind, &input)
                }))
                .unwrap_or(Err(JobError::Panicked(kind)));
                let elapsed = started.elapsed();

                match &outcome {
                    Ok(_) => log::info!("{} finished for track {} in {:.1?}", kind, track, elapsed),
                    Err(e) => log::warn!("{} failed for track {}: {}", kind, track, e),
                }

                // Receiver gone means the session shut down; nothing to report to.
                let _ = worker_tx.send(JobEvent {
                    track,
                    kind,
                    outcome,
                    elapsed,
                });
            });

        if let Err(e) = spawned {
            log::error!("Could not start {} worker: {}", kind, e);
            let _ = tx.send(JobEvent {
                track,
                kind,
                outcome: Err(JobError::Io(e)),
                elapsed: Duration::ZERO,
            });
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn collect(rx: &mut JobReceiver, n: usize) -> Vec<JobEvent> {
        (0..n).map(|_| rx.blocking_recv().unwrap()).collect()
    }

    #[test]
    fn test_dispatch_reports_every_job() {
        let input = scratch_audio("dispatch_all");
        let backend = Arc::new(FakeBackend::ok(ChordTimeline::from_triples([(0.0, 1.0, "C")])));
        let (tx, mut rx) = job_channel();
        let track = TrackId::next();

        dispatch(backend, track, &input, &JobKind::ALL, &tx);
        let events = collect(&mut rx, 4);

        assert!(events.iter().all(|e| e.track == track && e.outcome.is_ok()));
        for kind in JobKind::ALL {
            assert!(events.iter().any(|e| e.kind == kind), "missing {kind}");
        }
    }

    #[test]
    fn test_failures_are_independent() {
        let input = scratch_audio("dispatch_fail");
        let mut backend = FakeBackend::ok(ChordTimeline::default());
        backend.chords = Err("model crashed".to_string());
        let (tx, mut rx) = job_channel();

        dispatch(
            Arc::new(backend),
            TrackId::next(),
            &input,
            &[JobKind::Chords, JobKind::Key, JobKind::Tempo],
            &tx,
        );
        let events = collect(&mut rx, 3);

        for event in &events {
            match event.kind {
                JobKind::Chords => assert!(event.outcome.is_err()),
                JobKind::Key => assert_eq!(event.outcome.as_ref().unwrap(), &JobPayload::Key("A minor".into())),
                JobKind::Tempo => assert!(event.outcome.is_ok()),
                JobKind::Separation => unreachable!(),
            }
        }
    }

    #[test]
    fn test_missing_input_is_reported() {
        let backend = FakeBackend::ok(ChordTimeline::default());
        let err = run_job(&backend, JobKind::Key, Path::new("/no/such/file.wav")).unwrap_err();
        assert!(matches!(err, JobError::MissingInput(_)));
    }

    #[test]
    fn test_track_ids_increase() {
        let a = TrackId::next();
        let b = TrackId::next();
        assert!(b > a);
        assert_ne!(a, b);
    }
}
