use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{ChildStdout, Command, ExitStatus, Stdio};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("`{tool}` not found in PATH; install ffmpeg or pass its location explicitly")]
    NotFound {
        tool: String,
        #[source]
        source: which::Error,
    },
    #[error("failed to start {}", tool.display())]
    Spawn {
        tool: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} exited with {status}: {stderr}", tool.display())]
    Failed {
        tool: PathBuf,
        status: ExitStatus,
        stderr: String,
    },
    #[error("could not read a duration for {}: {reason}", path.display())]
    InvalidProbe { path: PathBuf, reason: String },
    #[error("could not move merged output into place")]
    Persist(#[from] tempfile::PathPersistError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Deserialize, Debug)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Deserialize, Debug)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Resolved locations of the ffmpeg and ffprobe executables.
#[derive(Debug, Clone)]
pub struct MediaTool {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl MediaTool {
    pub fn locate(ffmpeg: &Path, ffprobe: &Path) -> Result<Self, ToolError> {
        Ok(Self {
            ffmpeg: find_program(ffmpeg)?,
            ffprobe: find_program(ffprobe)?,
        })
    }

    /// Container duration as reported by ffprobe.
    pub fn probe_duration(&self, path: &Path) -> Result<Duration, ToolError> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error"])
            .args(["-show_entries", "format=duration"])
            .args(["-of", "json"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ToolError::Spawn {
                tool: self.ffprobe.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ToolError::Failed {
                tool: self.ffprobe.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_probe_output(&output.stdout).map_err(|reason| ToolError::InvalidProbe {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Joins `parts` in order into `dest` with the concat demuxer and stream copy.
    ///
    /// ffmpeg writes into a temporary file next to `dest`, which only replaces `dest`
    /// once ffmpeg exits successfully. `on_progress` receives the output timestamp
    /// reached so far.
    pub fn concat<F>(
        &self,
        parts: &[&Path],
        dest: &Path,
        mut on_progress: F,
    ) -> Result<(), ToolError>
    where
        F: FnMut(Duration),
    {
        let mut list_file = tempfile::Builder::new()
            .prefix("concat-")
            .suffix(".txt")
            .tempfile()?;
        list_file.write_all(concat_list(parts)?.as_bytes())?;
        list_file.flush()?;

        let dest_dir = match dest.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let suffix = dest
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let partial = tempfile::Builder::new()
            .prefix(".merging-")
            .suffix(&suffix)
            .tempfile_in(dest_dir)?
            .into_temp_path();

        let mut stderr_log = tempfile::tempfile()?;

        log::debug!(
            "Running {} concat of {} parts into {}",
            self.ffmpeg.display(),
            parts.len(),
            partial.display()
        );

        let mut child = Command::new(&self.ffmpeg)
            .args(concat_args(list_file.path(), &partial))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(stderr_log.try_clone()?)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                tool: self.ffmpeg.clone(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            if let Err(error) = follow_progress(stdout, &mut on_progress) {
                // ffmpeg must not keep writing into `partial` once it is dropped.
                if let Err(kill_error) = child.kill() {
                    log::debug!("Could not stop {}: {kill_error}", self.ffmpeg.display());
                }
                child.wait()?;
                return Err(error.into());
            }
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(ToolError::Failed {
                tool: self.ffmpeg.clone(),
                status,
                stderr: read_tail(&mut stderr_log)?,
            });
        }

        partial.persist(dest)?;
        Ok(())
    }
}

/// Stream-copies video and audio only. GoPro timecode and telemetry tracks cannot be
/// muxed back into MP4 and are left out.
fn concat_args(list_file: &Path, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-nostats", "-loglevel", "error"]
        .into_iter()
        .chain(["-f", "concat", "-safe", "0", "-i"])
        .map(OsString::from)
        .collect();
    args.push(list_file.into());
    args.extend(
        ["-map", "0:v", "-map", "0:a?", "-c", "copy"]
            .into_iter()
            .chain(["-movflags", "+faststart"])
            .chain(["-progress", "pipe:1", "-y"])
            .map(OsString::from),
    );
    args.push(output.into());
    args
}

fn follow_progress<F>(stdout: ChildStdout, on_progress: &mut F) -> io::Result<()>
where
    F: FnMut(Duration),
{
    for line in BufReader::new(stdout).lines() {
        if let Some(position) = parse_progress_line(&line?) {
            on_progress(position);
        }
    }
    Ok(())
}

fn find_program(program: &Path) -> Result<PathBuf, ToolError> {
    which::which(program).map_err(|source| ToolError::NotFound {
        tool: program.display().to_string(),
        source,
    })
}

fn parse_probe_output(stdout: &[u8]) -> Result<Duration, String> {
    let probe: ProbeOutput = serde_json::from_slice(stdout).map_err(|e| e.to_string())?;
    let raw = probe
        .format
        .duration
        .ok_or_else(|| "ffprobe reported no duration".to_string())?;
    let seconds: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("unexpected duration {raw:?}"))?;
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("unexpected duration {raw:?}: {e}"))
}

/// `out_time_us=…` lines from `-progress` output.
fn parse_progress_line(line: &str) -> Option<Duration> {
    let micros = line.trim().strip_prefix("out_time_us=")?;
    micros.parse::<u64>().ok().map(Duration::from_micros)
}

/// Concat demuxer script listing each part by absolute path.
fn concat_list(parts: &[&Path]) -> io::Result<String> {
    let mut list = String::new();
    for part in parts {
        let absolute = fs::canonicalize(part)?;
        // Single quotes are closed, escaped, and reopened inside the quoted path.
        let escaped = absolute.to_string_lossy().replace('\'', r"'\''");
        list.push_str("file '");
        list.push_str(&escaped);
        list.push_str("'\n");
    }
    Ok(list)
}

fn read_tail(log: &mut File) -> io::Result<String> {
    let mut captured = String::new();
    log.seek(SeekFrom::Start(0))?;
    log.read_to_string(&mut captured)?;

    let lines: Vec<&str> = captured.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    Ok(lines[start..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_duration_from_ffprobe_json() {
        let json = br#"{ "format": { "duration": "61.394000" } }"#;
        let duration = parse_probe_output(json).unwrap();
        assert!((duration.as_secs_f64() - 61.394).abs() < 1e-6);
    }

    #[test]
    fn missing_or_bad_duration_is_an_error() {
        assert!(parse_probe_output(br#"{ "format": {} }"#).is_err());
        assert!(parse_probe_output(br#"{ "format": { "duration": "N/A" } }"#).is_err());
        assert!(parse_probe_output(b"not json").is_err());
    }

    #[test]
    fn concat_copies_only_video_and_audio() {
        let args = concat_args(Path::new("/tmp/list.txt"), Path::new("/out/.merging-1.MP4"));
        let args: Vec<String> = args
            .iter()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();

        let maps: Vec<&str> = args
            .windows(2)
            .filter(|pair| pair[0] == "-map")
            .map(|pair| pair[1].as_str())
            .collect();
        assert_eq!(maps, vec!["0:v", "0:a?"]);

        let joined = args.join(" ");
        assert!(joined.contains("-f concat -safe 0 -i /tmp/list.txt"));
        assert!(joined.contains("-c copy"));
        assert!(joined.contains("-movflags +faststart"));
        assert_eq!(args.last().map(String::as_str), Some("/out/.merging-1.MP4"));
    }

    #[test]
    fn progress_lines() {
        assert_eq!(
            parse_progress_line("out_time_us=1500000"),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(parse_progress_line("out_time_us=N/A"), None);
        assert_eq!(parse_progress_line("frame=12"), None);
    }

    #[cfg(unix)]
    #[test]
    fn concat_list_uses_absolute_quoted_paths() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("GH011447.MP4");
        let quoted = dir.path().join("it's.MP4");
        fs::write(&plain, b"a").unwrap();
        fs::write(&quoted, b"b").unwrap();

        let list = concat_list(&[plain.as_path(), quoted.as_path()]).unwrap();
        let lines: Vec<&str> = list.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("file '/"));
        assert!(lines[0].ends_with("GH011447.MP4'"));
        assert!(lines[1].ends_with(r"it'\''s.MP4'"));
    }

    #[test]
    fn missing_program_is_reported() {
        let err = MediaTool::locate(
            Path::new("definitely-not-a-real-ffmpeg"),
            Path::new("definitely-not-a-real-ffprobe"),
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
    }
}
