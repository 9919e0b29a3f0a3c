use std::io::{self, Stdout, Write};

use crate::metadata::format_clock;
use crate::playback::{Notice, PlaybackState, ViewSink};
use crate::timeline::NO_CHORD;
use crate::tracker::ResolvedView;

const BAR_WIDTH: usize = 10;

/// Karaoke-style chord line on a terminal, redrawn in place.
pub struct TerminalView<W: Write> {
    out: W,
    last_line: String,
    show_line: bool,
}

impl TerminalView<Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> TerminalView<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            last_line: String::new(),
            show_line: true,
        }
    }

    /// Print notices only; the chord line is never drawn.
    pub fn notices_only(out: W) -> Self {
        Self {
            show_line: false,
            ..Self::new(out)
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn message(&mut self, text: &str) {
        // Terminal write failures aren't actionable mid-playback
        let lead = if self.last_line.is_empty() { "" } else { "\n" };
        let _ = writeln!(self.out, "{lead}{text}");
        let _ = self.out.flush();
        self.last_line.clear();
    }
}

fn display_label(label: Option<&str>) -> &str {
    match label {
        Some(NO_CHORD) | None => "",
        Some(l) => l,
    }
}

fn progress_bar(progress: f64) -> String {
    let filled = ((progress.clamp(0.0, 1.0) * BAR_WIDTH as f64).round() as usize).min(BAR_WIDTH);
    format!("{}{}", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled))
}

/// `0:03/3:20     C  [   G    ###------- ]  Am     F`
pub fn format_view(view: &ResolvedView, duration_ms: u64) -> String {
    let bar = if view.has_chord() {
        progress_bar(view.progress)
    } else {
        " ".repeat(BAR_WIDTH)
    };
    format!(
        "{}/{}  {:>6} {:>6}  [ {:^8} {} ]  {:<6} {:<6}",
        format_clock(view.position_ms),
        format_clock(duration_ms),
        display_label(view.pre_previous.as_deref()),
        display_label(view.previous.as_deref()),
        display_label(view.current.as_deref()),
        bar,
        display_label(view.next.as_deref()),
        display_label(view.post_next.as_deref()),
    )
}

impl<W: Write> ViewSink for TerminalView<W> {
    fn show(&mut self, view: &ResolvedView, duration_ms: u64) {
        if !self.show_line {
            return;
        }
        let line = format_view(view, duration_ms);
        if line != self.last_line {
            let _ = write!(self.out, "\r{line}");
            let _ = self.out.flush();
            self.last_line = line;
        }
    }

    fn notify(&mut self, notice: Notice) {
        let text = match notice {
            Notice::TrackLoaded { title, duration_ms } if duration_ms > 0 => {
                format!("Loaded: {} ({})", title, format_clock(duration_ms))
            }
            Notice::TrackLoaded { title, .. } => format!("Loaded: {title}"),
            Notice::StateChanged(PlaybackState::Playing) => "▶ playing".to_string(),
            Notice::StateChanged(PlaybackState::Paused) => "⏸ paused".to_string(),
            Notice::StateChanged(PlaybackState::Stopped) => "■ stopped".to_string(),
            Notice::KeyTempo(line) => line,
            Notice::StemReady(path) => format!("Isolated stem: {}", path.display()),
            Notice::JobFailed { kind, message } => format!("{kind} failed: {message}"),
            Notice::Exported(path) => format!("Chords exported to {}", path.display()),
        };
        self.message(&text);
    }
}
