use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;

use super::separation::{self, Separator};
use super::{AnalysisBackend, JobError, JobKind};
use crate::config::{AppConfig, ToolConfig};
use crate::timeline::ChordTimeline;

/// Runs the configured external tools as subprocesses.
pub struct CommandBackend {
    separator: Separator,
    chords: ToolConfig,
    key: ToolConfig,
    tempo: ToolConfig,
}

impl CommandBackend {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            separator: Separator::new(
                config.separation.tool(),
                &config.separation.stem,
                config.resolve_stems_dir(),
            ),
            chords: config.chords.clone(),
            key: config.key.clone(),
            tempo: config.tempo.clone(),
        }
    }
}

impl AnalysisBackend for CommandBackend {
    fn separate(&self, input: &Path) -> Result<PathBuf, JobError> {
        self.separator.isolate(input)
    }

    fn recognize_chords(&self, input: &Path) -> Result<ChordTimeline, JobError> {
        let stdout = run_tool(JobKind::Chords, &self.chords, input, None)?;
        Ok(ChordTimeline::parse(&stdout)?)
    }

    fn detect_key(&self, input: &Path) -> Result<String, JobError> {
        let stdout = run_tool(JobKind::Key, &self.key, input, None)?;
        parse_key(&stdout)
    }

    fn detect_tempo(&self, input: &Path) -> Result<f64, JobError> {
        let stdout = run_tool(JobKind::Tempo, &self.tempo, input, None)?;
        parse_tempo(&stdout)
    }
}

/// Replace `{input}` / `{out_dir}` placeholders in tool arguments.
pub fn expand_args(args: &[String], input: &Path, out_dir: Option<&Path>) -> Vec<String> {
    let input = input.to_string_lossy();
    let out_dir = out_dir.map(|d| d.to_string_lossy()).unwrap_or_default();
    args.iter()
        .map(|a| a.replace("{input}", &input).replace("{out_dir}", &out_dir))
        .collect()
}

/// Run a tool to completion and return its stdout. A non-zero exit is a
/// failure carrying the exit status and the combined output.
pub fn run_tool(
    kind: JobKind,
    tool: &ToolConfig,
    input: &Path,
    out_dir: Option<&Path>,
) -> Result<String, JobError> {
    if !tool.is_configured() {
        return Err(JobError::NotConfigured(kind));
    }
    let args = expand_args(&tool.args, input, out_dir);
    log::debug!("Running {} {}", tool.program, args.join(" "));

    let output = Command::new(&tool.program)
        .args(&args)
        .output()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => JobError::ToolNotFound(tool.program.clone()),
            _ => JobError::Io(e),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(JobError::ToolFailed {
            tool: tool.program.clone(),
            status: separation::describe_status(&output.status),
            log: format!("{stdout}{stderr}").trim_end().to_string(),
        });
    }
    Ok(stdout)
}

fn parse_key(stdout: &str) -> Result<String, JobError> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from)
        .ok_or_else(|| JobError::BadOutput {
            kind: JobKind::Key,
            message: "empty output".to_string(),
        })
}

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("static regex"));

/// First number in the output, e.g. `Estimated tempo: 118.4 BPM` → 118.4.
fn parse_tempo(stdout: &str) -> Result<f64, JobError> {
    let bad = |message: String| JobError::BadOutput {
        kind: JobKind::Tempo,
        message,
    };
    let m = NUMBER
        .find(stdout)
        .ok_or_else(|| bad(format!("no number in {:?}", stdout.trim())))?;
    let bpm: f64 = m
        .as_str()
        .parse()
        .map_err(|_| bad(format!("invalid number {:?}", m.as_str())))?;
    if bpm <= 0.0 {
        return Err(bad(format!("non-positive tempo {bpm}")));
    }
    Ok(bpm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(program: &str, args: &[&str]) -> ToolConfig {
        ToolConfig {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_expand_args() {
        let args = ["--out", "{out_dir}", "{input}", "--tag={input}"].map(String::from);
        let expanded = expand_args(&args, Path::new("/a/song.mp3"), Some(Path::new("/tmp/x")));
        assert_eq!(expanded, vec!["--out", "/tmp/x", "/a/song.mp3", "--tag=/a/song.mp3"]);
    }

    #[test]
    fn test_parse_tempo() {
        assert!((parse_tempo("Estimated tempo: 118.4 BPM\n").unwrap() - 118.4).abs() < 1e-9);
        assert_eq!(parse_tempo("96").unwrap(), 96.0);
        assert!(parse_tempo("no idea").is_err());
        assert!(parse_tempo("0").is_err());
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("\n  E minor \n").unwrap(), "E minor");
        assert!(parse_key("   \n").is_err());
    }

    #[test]
    fn test_unconfigured_tool() {
        let err = run_tool(JobKind::Key, &ToolConfig::default(), Path::new("x.wav"), None).unwrap_err();
        assert!(matches!(err, JobError::NotConfigured(JobKind::Key)));
    }

    #[test]
    fn test_missing_program() {
        let err = run_tool(
            JobKind::Tempo,
            &tool("chordsync-definitely-not-installed", &[]),
            Path::new("x.wav"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, JobError::ToolNotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_tool_stdout_and_failure() {
        let out = run_tool(JobKind::Key, &tool("echo", &["{input}"]), Path::new("song.wav"), None)
            .unwrap();
        assert_eq!(out.trim(), "song.wav");

        let err = run_tool(
            JobKind::Chords,
            &tool("sh", &["-c", "echo boom; exit 3"]),
            Path::new("song.wav"),
            None,
        )
        .unwrap_err();
        match err {
            JobError::ToolFailed { status, log, .. } => {
                assert_eq!(status, "exit code 3");
                assert_eq!(log, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_command_backend_parses_chords() {
        let mut config = AppConfig::default();
        config.chords = tool("printf", &["0 2 C:maj\\n2 4 A:min\\n"]);
        let backend = CommandBackend::from_config(&config);
        let tl = backend.recognize_chords(Path::new("song.wav")).unwrap();
        assert_eq!(tl.len(), 2);
        assert_eq!(tl.get(1).unwrap().label, "Am");
    }
}
