use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

impl PlaybackState {
    pub fn is_playing(&self) -> bool {
        matches!(self, PlaybackState::Playing)
    }
}

/// Notifications a player pushes on its own, for players that report
/// position rather than being polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    PositionChanged(u64),
    DurationChanged(u64),
    StateChanged(PlaybackState),
    MediaEnded,
}

/// The playback transport the controller drives. Positions are in ms.
pub trait PlaybackSource {
    /// Point at new media of the given length and stop.
    fn load(&mut self, duration_ms: u64);
    fn position_ms(&self) -> u64;
    fn duration_ms(&self) -> u64;
    fn state(&self) -> PlaybackState;
    fn play(&mut self);
    fn pause(&mut self);
    fn stop(&mut self);
    fn set_position(&mut self, ms: u64);
    /// The player learned the real length after loading.
    fn set_duration(&mut self, duration_ms: u64);
    /// True once playback has run to the end of the media.
    fn media_ended(&self) -> bool;
}

/// Wall-clock transport: the position advances in real time while playing.
/// Stands in for an audio player when only the chord display is wanted.
#[derive(Debug, Default)]
pub struct ClockSource {
    duration_ms: u64,
    offset_ms: u64,
    started: Option<Instant>,
    paused: bool,
}

impl ClockSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn raw_position(&self) -> u64 {
        let running = self
            .started
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        self.offset_ms.saturating_add(running)
    }
}

impl PlaybackSource for ClockSource {
    fn load(&mut self, duration_ms: u64) {
        self.stop();
        self.duration_ms = duration_ms;
    }

    fn position_ms(&self) -> u64 {
        let pos = self.raw_position();
        if self.duration_ms > 0 {
            pos.min(self.duration_ms)
        } else {
            pos
        }
    }

    fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    fn state(&self) -> PlaybackState {
        if self.started.is_some() {
            PlaybackState::Playing
        } else if self.paused {
            PlaybackState::Paused
        } else {
            PlaybackState::Stopped
        }
    }

    fn play(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
            self.paused = false;
        }
    }

    fn pause(&mut self) {
        if self.started.is_some() {
            self.offset_ms = self.position_ms();
            self.started = None;
            self.paused = true;
        }
    }

    fn stop(&mut self) {
        self.started = None;
        self.paused = false;
        self.offset_ms = 0;
    }

    fn set_position(&mut self, ms: u64) {
        self.offset_ms = ms;
        if self.started.is_some() {
            self.started = Some(Instant::now());
        }
    }

    fn set_duration(&mut self, duration_ms: u64) {
        self.duration_ms = duration_ms;
    }

    fn media_ended(&self) -> bool {
        self.started.is_some() && self.duration_ms > 0 && self.raw_position() >= self.duration_ms
    }
}
