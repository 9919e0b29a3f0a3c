use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label used for segments where no chord is sounding.
pub const NO_CHORD: &str = "N";

#[derive(Error, Debug)]
pub enum TimelineError {
    #[error("Malformed segment at {location}: {message}")]
    Malformed { location: String, message: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unrecognized timeline format")]
    UnknownFormat,
}

pub type Result<T> = std::result::Result<T, TimelineError>;

/// One chord over a half-open time range `[start, end)`, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChordSegment {
    pub start: f64,
    pub end: f64,
    pub label: String,
}

impl ChordSegment {
    pub fn new(start: f64, end: f64, label: impl Into<String>) -> Self {
        Self {
            start,
            end,
            label: label.into(),
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Zero-length segments occupy only the instant `start`.
    pub fn is_degenerate(&self) -> bool {
        self.duration() <= 0.0
    }

    pub fn is_no_chord(&self) -> bool {
        self.label == NO_CHORD
    }

    /// True once playback at `t` seconds has moved past this segment.
    ///
    /// Ordinary segments are half-open, so `t == end` is already past.
    /// A degenerate segment stays current at exactly its own instant.
    pub fn is_behind(&self, t: f64) -> bool {
        if self.is_degenerate() {
            self.end < t || (self.end == t && self.start != t)
        } else {
            self.end <= t
        }
    }
}

/// Ordered, read-only chord sequence for one track.
///
/// Built once from recognizer output; a reload replaces the whole timeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChordTimeline {
    segments: Vec<ChordSegment>,
}

impl ChordTimeline {
    /// Build from (start, end, label) triples. Input is stably sorted by start
    /// if the producer did not already do so.
    pub fn new(mut segments: Vec<ChordSegment>) -> Self {
        if !segments.windows(2).all(|w| w[0].start <= w[1].start) {
            log::debug!("Timeline input not sorted, sorting {} segments", segments.len());
            segments.sort_by(|a, b| a.start.total_cmp(&b.start));
        }
        Self { segments }
    }

    pub fn from_triples<I, S>(triples: I) -> Self
    where
        I: IntoIterator<Item = (f64, f64, S)>,
        S: Into<String>,
    {
        Self::new(
            triples
                .into_iter()
                .map(|(start, end, label)| ChordSegment::new(start, end, label))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ChordSegment> {
        self.segments.get(index)
    }

    pub fn segments(&self) -> &[ChordSegment] {
        &self.segments
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChordSegment> {
        self.segments.iter()
    }

    /// End of the last segment, in seconds.
    pub fn end_time(&self) -> f64 {
        self.segments.iter().map(|s| s.end).fold(0.0, f64::max)
    }

    /// Parse recognizer output. Accepts a JAMS document, a JSON array of
    /// `[start, end, label]` / `{start, end, label}` entries, or `.lab` text.
    /// Labels are normalized with [`normalize_label`].
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim_start();
        let raw = if trimmed.starts_with('{') {
            parse_jams(trimmed)?
        } else if trimmed.starts_with('[') {
            parse_json(trimmed)?
        } else {
            parse_lab(text)?
        };

        let segments = raw
            .into_iter()
            .map(|(loc, seg)| validate(loc, seg))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(segments))
    }
}

impl<'a> IntoIterator for &'a ChordTimeline {
    type Item = &'a ChordSegment;
    type IntoIter = std::slice::Iter<'a, ChordSegment>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}

fn validate(location: String, mut seg: ChordSegment) -> Result<ChordSegment> {
    let bad = |message: &str| TimelineError::Malformed {
        location: location.clone(),
        message: message.to_string(),
    };
    if !seg.start.is_finite() || !seg.end.is_finite() {
        return Err(bad("non-finite time"));
    }
    if seg.start < 0.0 {
        return Err(bad("negative start"));
    }
    if seg.end < seg.start {
        return Err(bad("end before start"));
    }
    seg.label = normalize_label(&seg.label);
    Ok(seg)
}

fn parse_lab(text: &str) -> Result<Vec<(String, ChordSegment)>> {
    let mut out = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let location = format!("line {}", n + 1);
        let mut fields = line.split_whitespace();
        let (Some(start), Some(end), Some(label)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(TimelineError::Malformed {
                location,
                message: "expected `start end label`".to_string(),
            });
        };
        let parse_time = |s: &str| {
            s.parse::<f64>().map_err(|_| TimelineError::Malformed {
                location: location.clone(),
                message: format!("invalid time {s:?}"),
            })
        };
        let seg = ChordSegment::new(parse_time(start)?, parse_time(end)?, label);
        out.push((location, seg));
    }
    Ok(out)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonSegment {
    Triple(f64, f64, String),
    Object { start: f64, end: f64, label: String },
}

fn parse_json(text: &str) -> Result<Vec<(String, ChordSegment)>> {
    let entries: Vec<JsonSegment> = serde_json::from_str(text)?;
    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(i, e)| {
            let seg = match e {
                JsonSegment::Triple(start, end, label) => ChordSegment::new(start, end, label),
                JsonSegment::Object { start, end, label } => ChordSegment::new(start, end, label),
            };
            (format!("entry {i}"), seg)
        })
        .collect())
}

/// The parts of a JAMS document we read: chord annotations only.
#[derive(Deserialize)]
struct JamsDocument {
    #[serde(default)]
    annotations: Vec<JamsAnnotation>,
}

#[derive(Deserialize)]
struct JamsAnnotation {
    namespace: Option<String>,
    #[serde(default)]
    data: Vec<JamsObservation>,
}

#[derive(Deserialize)]
struct JamsObservation {
    #[serde(default)]
    time: f64,
    #[serde(default)]
    duration: f64,
    /// Strings for chord namespaces; other namespaces carry numbers etc.
    value: Option<serde_json::Value>,
}

fn parse_jams(text: &str) -> Result<Vec<(String, ChordSegment)>> {
    let doc: JamsDocument = serde_json::from_str(text)?;
    let mut out = Vec::new();
    let mut found = false;
    for annotation in doc
        .annotations
        .iter()
        .filter(|a| a.namespace.as_deref().is_some_and(|ns| ns.starts_with("chord")))
    {
        found = true;
        for (i, obs) in annotation.data.iter().enumerate() {
            let label = obs
                .value
                .as_ref()
                .and_then(|v| v.as_str())
                .unwrap_or(NO_CHORD)
                .to_string();
            out.push((
                format!("observation {i}"),
                ChordSegment::new(obs.time, obs.time + obs.duration, label),
            ));
        }
    }
    if !found {
        return Err(TimelineError::UnknownFormat);
    }
    Ok(out)
}

static HARTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<root>[A-G][#b]?)(?::(?P<quality>[^/]+))?(?:/(?P<bass>.+))?$")
        .expect("static regex")
});

/// Map recognizer labels onto the display vocabulary.
///
/// `C:maj` → `C`, `A:min7` → `Am7`, `G:7` → `G7`, `N`/`N/A`/`X`/empty → [`NO_CHORD`].
/// Labels that are not Harte-style pass through unchanged.
pub fn normalize_label(raw: &str) -> String {
    let label = raw.trim();
    if label.is_empty() || matches!(label, "N" | "N/A" | "NA" | "X" | "none") {
        return NO_CHORD.to_string();
    }
    let Some(caps) = HARTE.captures(label) else {
        return label.to_string();
    };
    let root = &caps["root"];
    let quality = match caps.name("quality").map(|m| m.as_str()) {
        None | Some("maj") => String::new(),
        Some(q) => match q.strip_prefix("min") {
            Some(rest) => format!("m{rest}"),
            None => q.to_string(),
        },
    };
    match caps.name("bass") {
        Some(bass) => format!("{root}{quality}/{}", bass.as_str()),
        None => format!("{root}{quality}"),
    }
}
