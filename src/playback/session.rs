use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::jobs::{JobKind, JobPayload, TrackId};
use crate::metadata::TrackInfo;
use crate::timeline::ChordTimeline;
use crate::tracker::{PositionTracker, ResolvedView};

/// Everything known about the currently loaded track.
///
/// One session per load; loading another file replaces it wholesale.
#[derive(Debug)]
pub struct Session {
    id: TrackId,
    info: TrackInfo,
    tracker: PositionTracker,
    key: Option<String>,
    tempo: Option<f64>,
    stem: Option<PathBuf>,
    pending: HashSet<JobKind>,
    failures: Vec<(JobKind, String)>,
}

impl Session {
    pub fn new(info: TrackInfo) -> Self {
        Self {
            id: TrackId::next(),
            info,
            tracker: PositionTracker::default(),
            key: None,
            tempo: None,
            stem: None,
            pending: JobKind::ALL.into_iter().collect(),
            failures: Vec::new(),
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }

    pub fn timeline(&self) -> &ChordTimeline {
        self.tracker.timeline()
    }

    pub fn has_timeline(&self) -> bool {
        !self.tracker.timeline().is_empty()
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn tempo(&self) -> Option<f64> {
        self.tempo
    }

    pub fn stem(&self) -> Option<&Path> {
        self.stem.as_deref()
    }

    pub fn failures(&self) -> &[(JobKind, String)] {
        &self.failures
    }

    pub fn is_settled(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    pub fn resolve(&mut self, position_ms: u64) -> ResolvedView {
        self.tracker.resolve(position_ms)
    }

    pub fn rewind(&mut self) {
        self.tracker.reset();
    }

    pub fn apply(&mut self, payload: JobPayload) {
        match payload {
            JobPayload::Stem(path) => {
                self.pending.remove(&JobKind::Separation);
                self.stem = Some(path);
            }
            JobPayload::Chords(timeline) => {
                self.pending.remove(&JobKind::Chords);
                self.tracker.set_timeline(timeline);
            }
            JobPayload::Key(key) => {
                self.pending.remove(&JobKind::Key);
                self.key = Some(key);
            }
            JobPayload::Tempo(bpm) => {
                self.pending.remove(&JobKind::Tempo);
                self.tempo = Some(bpm);
            }
        }
    }

    pub fn fail(&mut self, kind: JobKind, message: String) {
        self.pending.remove(&kind);
        self.failures.push((kind, message));
    }

    /// `E minor  |  120 BPM`, or whichever half is known.
    pub fn key_tempo_line(&self) -> Option<String> {
        let tempo = self.tempo.map(|bpm| format!("{} BPM", bpm.round()));
        match (self.key.as_deref(), tempo) {
            (Some(key), Some(tempo)) => Some(format!("{key}  |  {tempo}")),
            (Some(key), None) => Some(key.to_string()),
            (None, Some(tempo)) => Some(tempo),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(TrackInfo {
            title: "riff".to_string(),
            artist: Some("The Band".to_string()),
            duration_ms: Some(90_000),
        })
    }

    #[test]
    fn test_sessions_get_distinct_ids() {
        assert_ne!(session().id(), session().id());
    }

    #[test]
    fn test_apply_and_fail_settle_jobs() {
        let mut s = session();
        assert!(!s.is_settled());
        s.apply(JobPayload::Chords(ChordTimeline::from_triples([(0.0, 1.0, "C")])));
        s.apply(JobPayload::Key("C major".into()));
        s.apply(JobPayload::Stem(PathBuf::from("/stems/riff_other.wav")));
        assert!(s.has_timeline());
        assert!(!s.is_settled());

        s.fail(JobKind::Tempo, "tool crashed".into());
        assert!(s.is_settled());
        assert_eq!(s.failures().len(), 1);
        assert_eq!(s.key_tempo_line().as_deref(), Some("C major"));
        assert_eq!(s.info().artist.as_deref(), Some("The Band"));
    }

    #[test]
    fn test_key_tempo_line() {
        let mut s = session();
        assert_eq!(s.key_tempo_line(), None);
        s.apply(JobPayload::Tempo(117.6));
        assert_eq!(s.key_tempo_line().as_deref(), Some("118 BPM"));
        s.apply(JobPayload::Key("A minor".into()));
        assert_eq!(s.key_tempo_line().as_deref(), Some("A minor  |  118 BPM"));
    }
}
