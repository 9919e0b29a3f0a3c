pub mod session;
pub mod source;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::cache::{AnalysisCache, FileStamp};
use crate::config::PlaybackConfig;
use crate::export::{self, ExportError};
use crate::jobs::{self, AnalysisBackend, JobEvent, JobKind, JobPayload, JobSender, TrackId};
use crate::metadata::{self, TrackInfo};
use crate::tracker::ResolvedView;
pub use session::Session;
pub use source::{ClockSource, PlaybackSource, PlaybackState, SourceEvent};

#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("Cannot open {path}: {reason}")]
    Unreadable { path: String, reason: String },
    #[error("No track loaded")]
    NoTrack,
    #[error("Export failed: {0}")]
    Export(#[from] ExportError),
}

/// Things the presentation layer should tell the user about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    TrackLoaded { title: String, duration_ms: u64 },
    StateChanged(PlaybackState),
    /// Key and/or tempo became known, pre-formatted for display.
    KeyTempo(String),
    StemReady(PathBuf),
    JobFailed { kind: JobKind, message: String },
    Exported(PathBuf),
}

/// Presentation layer. Receives a fresh view on every position update.
pub trait ViewSink {
    fn show(&mut self, view: &ResolvedView, duration_ms: u64);
    fn notify(&mut self, notice: Notice);
}

/// What happened to a job result handed to [`PlaybackController::handle_job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Applied,
    Failed,
    /// Launched for a track that is no longer loaded; dropped.
    Stale,
}

/// Owns the session and the transport, and turns every position update into
/// a [`ResolvedView`] for the presentation layer.
///
/// Must only be driven from one thread; analysis results reach it as
/// [`JobEvent`]s through [`PlaybackController::handle_job`].
pub struct PlaybackController<S: PlaybackSource, V: ViewSink> {
    source: S,
    view: V,
    config: PlaybackConfig,
    backend: Arc<dyn AnalysisBackend>,
    jobs_tx: JobSender,
    cache: Option<AnalysisCache>,
    session: Option<Session>,
    stamp: Option<FileStamp>,
    timer_active: bool,
    scrubbing: bool,
    last_view: ResolvedView,
}

impl<S: PlaybackSource, V: ViewSink> PlaybackController<S, V> {
    pub fn new(
        source: S,
        view: V,
        config: PlaybackConfig,
        backend: Arc<dyn AnalysisBackend>,
        jobs_tx: JobSender,
    ) -> Self {
        Self {
            source,
            view,
            config,
            backend,
            jobs_tx,
            cache: None,
            session: None,
            stamp: None,
            timer_active: false,
            scrubbing: false,
            last_view: ResolvedView::default(),
        }
    }

    pub fn with_cache(mut self, cache: AnalysisCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn state(&self) -> PlaybackState {
        self.source.state()
    }

    pub fn position_ms(&self) -> u64 {
        self.source.position_ms()
    }

    pub fn last_view(&self) -> &ResolvedView {
        &self.last_view
    }

    pub fn timer_active(&self) -> bool {
        self.timer_active
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.config.tick_interval_ms.max(1))
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    /// Load a new track: stop playback, replace the session, and launch
    /// analysis. Results still in flight for the previous track will be
    /// discarded when they arrive.
    pub fn load(&mut self, path: &Path) -> Result<TrackId, PlaybackError> {
        let stamp = FileStamp::of(path).map_err(|e| PlaybackError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if !path.is_file() {
            return Err(PlaybackError::Unreadable {
                path: path.display().to_string(),
                reason: "not a file".to_string(),
            });
        }

        self.timer_active = false;
        self.scrubbing = false;
        let info: TrackInfo = metadata::read_track_info(path);
        let duration_ms = info.duration_ms.unwrap_or(0);
        self.source.load(duration_ms);

        let session = Session::new(info);
        let id = session.id();
        log::info!("Loaded {} as track {}", path.display(), id);
        self.view.notify(Notice::TrackLoaded {
            title: session.title().to_string(),
            duration_ms,
        });
        self.session = Some(session);
        self.refresh(0);

        let mut to_run: Vec<JobKind> = JobKind::ALL.to_vec();
        if let Some(cached) = self.cached_analysis(&stamp) {
            for (kind, payload) in cached.payloads() {
                // Same path as a live result so staleness rules still apply
                let _ = self.jobs_tx.send(JobEvent {
                    track: id,
                    kind,
                    outcome: Ok(payload),
                    elapsed: Duration::ZERO,
                });
            }
            to_run.retain(|k| !cached.covers(*k));
        }
        self.stamp = Some(stamp);

        jobs::dispatch(Arc::clone(&self.backend), id, path, &to_run, &self.jobs_tx);
        Ok(id)
    }

    fn cached_analysis(&self, stamp: &FileStamp) -> Option<crate::cache::CachedAnalysis> {
        let cache = self.cache.as_ref()?;
        match cache.lookup(stamp) {
            Ok(hit) => hit,
            Err(e) => {
                log::warn!("Cache lookup failed for {}: {}", stamp.path, e);
                None
            }
        }
    }

    /// Fold one analysis result into the session.
    pub fn handle_job(&mut self, event: JobEvent) -> Applied {
        let Some(session) = self.session.as_mut().filter(|s| s.id() == event.track) else {
            log::debug!("Discarding stale {} result for track {}", event.kind, event.track);
            return Applied::Stale;
        };

        match event.outcome {
            Ok(payload) => {
                if let (Some(cache), Some(stamp)) = (&self.cache, &self.stamp) {
                    if let Err(e) = cache.record(stamp, &payload) {
                        log::warn!("Could not cache {} result: {}", event.kind, e);
                    }
                }

                let notice = match &payload {
                    JobPayload::Stem(path) => Some(Notice::StemReady(path.clone())),
                    JobPayload::Key(_) | JobPayload::Tempo(_) => None,
                    JobPayload::Chords(tl) => {
                        log::info!("Chord timeline ready: {} segments", tl.len());
                        None
                    }
                };
                let is_chords = matches!(payload, JobPayload::Chords(_));
                session.apply(payload);

                if matches!(event.kind, JobKind::Key | JobKind::Tempo) {
                    if let Some(line) = session.key_tempo_line() {
                        self.view.notify(Notice::KeyTempo(line));
                    }
                }
                if let Some(notice) = notice {
                    self.view.notify(notice);
                }

                if is_chords {
                    let position = self.source.position_ms();
                    self.refresh(position);
                    if self.config.auto_play && !self.source.state().is_playing() {
                        self.play_pause();
                    }
                }
                Applied::Applied
            }
            Err(e) => {
                let message = e.to_string();
                session.fail(event.kind, message.clone());
                self.view.notify(Notice::JobFailed {
                    kind: event.kind,
                    message,
                });
                Applied::Failed
            }
        }
    }

    /// Toggle between playing and paused; starts the timer when playing.
    pub fn play_pause(&mut self) {
        if self.session.is_none() {
            return;
        }
        if self.source.state().is_playing() {
            self.source.pause();
            self.timer_active = false;
        } else {
            self.source.play();
            self.timer_active = true;
        }
        self.view.notify(Notice::StateChanged(self.source.state()));
    }

    pub fn stop(&mut self) {
        self.timer_active = false;
        self.source.stop();
        if let Some(session) = self.session.as_mut() {
            session.rewind();
        }
        self.refresh(0);
        self.view.notify(Notice::StateChanged(PlaybackState::Stopped));
    }

    /// Timer-driven update. Does nothing unless the timer runs and no scrub
    /// is in progress.
    pub fn tick(&mut self) -> Option<&ResolvedView> {
        if !self.timer_active || self.scrubbing {
            return None;
        }
        if self.source.media_ended() {
            self.on_media_ended();
        } else {
            let position = self.source.position_ms();
            self.refresh(position);
        }
        Some(&self.last_view)
    }

    /// Jump by `delta_ms`. Jumping outside the track stops and rewinds.
    /// With an unknown duration only the start bounds the jump.
    pub fn seek_relative(&mut self, delta_ms: i64) {
        let target = self.source.position_ms() as i64 + delta_ms;
        let duration = self.source.duration_ms() as i64;
        if target < 0 || (duration > 0 && target > duration) {
            log::debug!("Relative seek to {}ms out of range, stopping", target);
            self.source.set_position(0);
            self.refresh(0);
            self.source.stop();
            self.timer_active = false;
            self.view.notify(Notice::StateChanged(PlaybackState::Stopped));
        } else {
            self.seek_to(target as u64);
        }
    }

    pub fn seek_forward(&mut self) {
        self.seek_relative(self.config.seek_step_ms as i64);
    }

    pub fn seek_back(&mut self) {
        self.seek_relative(-(self.config.seek_step_ms as i64));
    }

    /// Absolute seek. Leaves the playing/paused state alone.
    pub fn seek_to(&mut self, position_ms: u64) {
        let duration = self.source.duration_ms();
        let position = if duration > 0 {
            position_ms.min(duration)
        } else {
            position_ms
        };
        self.source.set_position(position);
        self.refresh(position);
    }

    /// Start of a drag on the position slider: timer updates pause.
    pub fn begin_scrub(&mut self) {
        self.scrubbing = true;
    }

    pub fn scrub_to(&mut self, position_ms: u64) {
        self.seek_to(position_ms);
    }

    pub fn end_scrub(&mut self) {
        self.scrubbing = false;
    }

    /// Position/state reports from players that push rather than get polled.
    pub fn handle_source_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::PositionChanged(ms) => {
                if !self.scrubbing {
                    self.refresh(ms);
                }
            }
            SourceEvent::DurationChanged(ms) => {
                log::debug!("Duration now {}", metadata::format_clock(ms));
                self.source.set_duration(ms);
            }
            SourceEvent::StateChanged(state) => {
                self.timer_active = state.is_playing();
                self.view.notify(Notice::StateChanged(state));
            }
            SourceEvent::MediaEnded => self.on_media_ended(),
        }
    }

    fn on_media_ended(&mut self) {
        log::info!("End of media, rewinding");
        self.timer_active = false;
        self.source.set_position(0);
        if let Some(session) = self.session.as_mut() {
            session.rewind();
        }
        self.refresh(0);
        self.source.stop();
        self.view.notify(Notice::StateChanged(PlaybackState::Stopped));
    }

    pub fn export(&mut self, dir: &Path) -> Result<PathBuf, PlaybackError> {
        let session = self.session.as_ref().ok_or(PlaybackError::NoTrack)?;
        let path = export::write_listing(session.timeline(), dir, session.title())?;
        self.view.notify(Notice::Exported(path.clone()));
        Ok(path)
    }

    fn refresh(&mut self, position_ms: u64) {
        let view = match self.session.as_mut() {
            Some(session) => session.resolve(position_ms),
            None => ResolvedView {
                position_ms,
                ..ResolvedView::default()
            },
        };
        self.view.show(&view, self.source.duration_ms());
        self.last_view = view;
    }
}
