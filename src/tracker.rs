use crate::timeline::ChordTimeline;

/// Snapshot of the timeline around one playback position.
///
/// Recomputed on every position update and never stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedView {
    pub position_ms: u64,
    /// Index of the active segment, `None` past the end or inside a gap.
    pub index: Option<usize>,
    pub pre_previous: Option<String>,
    pub previous: Option<String>,
    pub current: Option<String>,
    pub next: Option<String>,
    pub post_next: Option<String>,
    /// Fraction of the active segment already played, in `[0, 1]`.
    pub progress: f64,
}

impl ResolvedView {
    pub fn has_chord(&self) -> bool {
        self.current.is_some()
    }
}

/// Counters for how much work the cursor does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub resolves: u64,
    /// Forward cursor increments across all resolves.
    pub steps: u64,
    /// Times the cursor was reset to 0 by a backward seek.
    pub rescans: u64,
}

/// Resolves playback positions against a chord timeline with a sticky cursor.
///
/// The cursor only moves forward while positions increase, so steady playback
/// costs amortized O(1) per resolve. A backward seek resets it to 0 and
/// rescans, which is fine for timelines of a few hundred segments.
#[derive(Debug, Default)]
pub struct PositionTracker {
    timeline: ChordTimeline,
    /// `reach[i]` is the latest end among segments `0..=i`.
    reach: Vec<f64>,
    cursor: usize,
    progress: f64,
    stats: ScanStats,
}

impl PositionTracker {
    pub fn new(timeline: ChordTimeline) -> Self {
        Self {
            reach: reach_of(&timeline),
            timeline,
            ..Self::default()
        }
    }

    pub fn timeline(&self) -> &ChordTimeline {
        &self.timeline
    }

    /// Replace the timeline wholesale (new track or re-analysis).
    pub fn set_timeline(&mut self, timeline: ChordTimeline) {
        self.reach = reach_of(&timeline);
        self.timeline = timeline;
        self.cursor = 0;
        self.progress = 0.0;
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Rewind the cursor to the first segment (end-of-media, stop).
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn resolve(&mut self, position_ms: u64) -> ResolvedView {
        let t = position_ms as f64 / 1000.0;
        self.stats.resolves += 1;

        let segments = self.timeline.segments();
        let len = segments.len();

        // Every segment before the cursor must already be behind `t`. Ends are
        // not monotone when segments overlap, so check the furthest reach as
        // well as the nearest segment (which covers zero-length instants).
        if self.cursor > 0
            && self.cursor <= len
            && (self.reach[self.cursor - 1] > t || !segments[self.cursor - 1].is_behind(t))
        {
            log::trace!(
                "Backward seek to {:.3}s from segment {}, rescanning",
                t,
                self.cursor
            );
            self.cursor = 0;
            self.stats.rescans += 1;
        }

        while self.cursor < len && segments[self.cursor].is_behind(t) {
            self.cursor += 1;
            self.stats.steps += 1;
        }

        let mut view = ResolvedView {
            position_ms,
            progress: self.progress,
            ..ResolvedView::default()
        };

        let Some(segment) = segments.get(self.cursor) else {
            return view;
        };

        let label_at = |offset: isize| {
            self.cursor
                .checked_add_signed(offset)
                .and_then(|i| segments.get(i))
                .map(|s| s.label.clone())
        };
        view.pre_previous = label_at(-2);
        view.previous = label_at(-1);

        if t < segment.start {
            // In a gap: nothing sounding, the cursor segment is up next.
            view.next = label_at(0);
            view.post_next = label_at(1);
            return view;
        }

        view.index = Some(self.cursor);
        view.current = Some(segment.label.clone());
        view.next = label_at(1);
        view.post_next = label_at(2);

        let duration = segment.duration();
        if duration > 0.0 {
            self.progress = ((t - segment.start) / duration).clamp(0.0, 1.0);
            view.progress = self.progress;
        }

        view
    }
}

fn reach_of(timeline: &ChordTimeline) -> Vec<f64> {
    timeline
        .iter()
        .scan(f64::NEG_INFINITY, |max, s| {
            *max = max.max(s.end);
            Some(*max)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_timeline() -> ChordTimeline {
        ChordTimeline::from_triples([
            (0.0, 2.0, "C"),
            (2.0, 5.0, "G"),
            (5.0, 5.0, "Am"),
            (5.0, 8.0, "F"),
        ])
    }

    fn contiguous(n: usize, len_secs: f64) -> ChordTimeline {
        let labels = ["C", "G", "Am", "F", "Dm", "E"];
        ChordTimeline::from_triples((0..n).map(|i| {
            let start = i as f64 * len_secs;
            (start, start + len_secs, labels[i % labels.len()])
        }))
    }

    #[test]
    fn test_worked_example() {
        let mut tracker = PositionTracker::new(example_timeline());

        let view = tracker.resolve(3000);
        assert_eq!(view.current.as_deref(), Some("G"));
        assert_eq!(view.previous.as_deref(), Some("C"));
        assert_eq!(view.pre_previous, None);
        assert_eq!(view.next.as_deref(), Some("Am"));
        assert_eq!(view.post_next.as_deref(), Some("F"));
        assert!((view.progress - 1.0 / 3.0).abs() < 1e-9);

        // Zero-length segment reached: progress keeps its previous value
        let view = tracker.resolve(5000);
        assert_eq!(view.current.as_deref(), Some("Am"));
        assert_eq!(view.index, Some(2));
        assert!((view.progress - 1.0 / 3.0).abs() < 1e-9);

        let view = tracker.resolve(9000);
        assert_eq!(view.current, None);
        assert_eq!(view.index, None);
        assert_eq!(view.previous, None);
        assert_eq!(view.next, None);
        assert!((view.progress - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_inside_segment_resolves_to_it() {
        let tl = example_timeline();
        for (i, seg) in tl.iter().enumerate().filter(|(_, s)| !s.is_degenerate()) {
            // Strictly inside: the degenerate "Am" shares F's start instant
            let mut ms = (seg.start * 1000.0) as u64 + 1;
            while (ms as f64) < seg.end * 1000.0 {
                // Fresh tracker each time so the cursor starts cold
                let mut tracker = PositionTracker::new(tl.clone());
                assert_eq!(tracker.resolve(ms).index, Some(i), "ms = {ms}");
                ms += 250;
            }
        }
    }

    #[test]
    fn test_boundary_belongs_to_next_segment() {
        let tl = contiguous(4, 2.0);
        let mut tracker = PositionTracker::new(tl);
        assert_eq!(tracker.resolve(2000).index, Some(1));
        assert_eq!(tracker.resolve(4000).index, Some(2));
        assert_eq!(tracker.resolve(8000).index, None);

        let mut tracker = PositionTracker::new(example_timeline());
        assert_eq!(tracker.resolve(2000).current.as_deref(), Some("G"));
        assert_eq!(tracker.resolve(8000).current, None);
    }

    #[test]
    fn test_past_end_is_none() {
        let mut tracker = PositionTracker::new(contiguous(3, 1.5));
        for ms in [4500, 4501, 10_000, u64::from(u32::MAX)] {
            assert!(!tracker.resolve(ms).has_chord(), "ms = {ms}");
        }
    }

    #[test]
    fn test_empty_timeline() {
        let mut tracker = PositionTracker::new(ChordTimeline::default());
        for ms in [0, 1000, 50_000] {
            let view = tracker.resolve(ms);
            assert_eq!(view.current, None);
            assert_eq!(tracker.cursor(), 0);
        }
    }

    #[test]
    fn test_monotonic_playback_never_rescans() {
        let n = 200;
        let mut tracker = PositionTracker::new(contiguous(n, 2.0));
        for ms in (0..(n as u64 * 2000 + 500)).step_by(100) {
            tracker.resolve(ms);
        }
        let stats = tracker.stats();
        assert_eq!(stats.rescans, 0);
        // Each segment is stepped over exactly once
        assert_eq!(stats.steps, n as u64);
    }

    #[test]
    fn test_backward_seek_rescans_and_finds_segment() {
        let mut tracker = PositionTracker::new(contiguous(10, 2.0));
        assert_eq!(tracker.resolve(15_000).index, Some(7));
        assert_eq!(tracker.stats().rescans, 0);

        let view = tracker.resolve(3_500);
        assert_eq!(view.index, Some(1));
        assert_eq!(tracker.stats().rescans, 1);

        // Staying in the same segment is not a backward seek
        tracker.resolve(3_900);
        assert_eq!(tracker.stats().rescans, 1);
    }

    #[test]
    fn test_backward_seek_after_end() {
        let mut tracker = PositionTracker::new(contiguous(3, 2.0));
        assert!(!tracker.resolve(7_000).has_chord());
        assert_eq!(tracker.cursor(), 3);
        assert_eq!(tracker.resolve(1_000).current.as_deref(), Some("C"));
    }

    #[test]
    fn test_seek_back_onto_degenerate_segment() {
        let mut tracker = PositionTracker::new(example_timeline());
        assert_eq!(tracker.resolve(6000).current.as_deref(), Some("F"));
        assert_eq!(tracker.resolve(5000).current.as_deref(), Some("Am"));
    }

    #[test]
    fn test_progress_monotonic_within_segment() {
        let mut tracker = PositionTracker::new(contiguous(2, 4.0));
        let mut last = -1.0;
        for ms in (0..4000).step_by(100) {
            let p = tracker.resolve(ms).progress;
            assert!((0.0..=1.0).contains(&p));
            assert!(p > last, "progress went from {last} to {p} at {ms}");
            last = p;
        }
    }

    #[test]
    fn test_gap_has_no_current_chord() {
        let tl = ChordTimeline::from_triples([(0.0, 2.0, "C"), (4.0, 6.0, "G"), (6.0, 8.0, "D")]);
        let mut tracker = PositionTracker::new(tl);
        tracker.resolve(1000);
        let view = tracker.resolve(3000);
        assert_eq!(view.current, None);
        assert_eq!(view.previous.as_deref(), Some("C"));
        assert_eq!(view.next.as_deref(), Some("G"));
        assert_eq!(view.post_next.as_deref(), Some("D"));
        assert!((view.progress - 0.5).abs() < 1e-9);

        assert_eq!(tracker.resolve(4000).current.as_deref(), Some("G"));
    }

    fn overlapping() -> ChordTimeline {
        ChordTimeline::from_triples([(0.0, 10.0, "A"), (2.0, 3.0, "B"), (3.0, 12.0, "C")])
    }

    #[test]
    fn test_overlapping_segments_resolve_by_position() {
        let mut cold = PositionTracker::new(overlapping());
        assert_eq!(cold.resolve(5000).current.as_deref(), Some("A"));

        let mut warm = PositionTracker::new(overlapping());
        assert_eq!(warm.resolve(11_000).current.as_deref(), Some("C"));
        assert_eq!(warm.resolve(5000).current.as_deref(), Some("A"));
        assert_eq!(warm.stats().rescans, 1);

        // Moving forward through the overlap never rescans
        let mut forward = PositionTracker::new(overlapping());
        for ms in (0..12_000).step_by(250) {
            forward.resolve(ms);
        }
        assert_eq!(forward.stats().rescans, 0);
    }

    #[test]
    fn test_set_timeline_resets_cursor() {
        let mut tracker = PositionTracker::new(contiguous(5, 1.0));
        tracker.resolve(3500);
        assert_eq!(tracker.cursor(), 3);
        tracker.set_timeline(contiguous(2, 1.0));
        assert_eq!(tracker.cursor(), 0);
        assert_eq!(tracker.progress(), 0.0);
    }
}
