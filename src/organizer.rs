use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use filetime::FileTime;
use thiserror::Error;

use crate::ffmpeg::{MediaTool, ToolError};
use crate::progress::MergeProgress;
use crate::utils::{self, GroupError, VideoGroup};

pub const OUTPUT_DIR_NAME: &str = "processed_videos";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Rename,
    Merge,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub input: PathBuf,
    /// Defaults to `processed_videos` inside the input directory.
    pub output: Option<PathBuf>,
    pub mode: Mode,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub quiet: bool,
}

impl Config {
    pub fn output_dir(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| self.input.join(OUTPUT_DIR_NAME))
    }
}

/// Problems that stop a run before any output is written.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("'{}' is not a readable directory", .0.display())]
    InputMissing(PathBuf),
    #[error("failed to list {}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create output directory {}", path.display())]
    CreateOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Group(#[from] GroupError),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("copy failed")]
    Copy(#[source] io::Error),
    #[error("merge failed")]
    Merge(#[source] ToolError),
}

/// A single output that could not be produced. Other outputs are unaffected.
#[derive(Debug)]
pub struct Failure {
    pub video_id: String,
    pub target: PathBuf,
    pub error: ProduceError,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub output_dir: PathBuf,
    pub written: Vec<PathBuf>,
    pub failures: Vec<Failure>,
    /// Media time of the groups merged successfully; zero in rename mode.
    pub merged_duration: Duration,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Organizer {
    config: Config,
}

impl Organizer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Scans, groups, and writes every output. Setup problems abort the whole run;
    /// a failing file or group is recorded and the remaining groups still run.
    pub fn run(&self) -> Result<RunSummary, SetupError> {
        let input = &self.config.input;
        if !input.is_dir() {
            return Err(SetupError::InputMissing(input.clone()));
        }

        let tool = match self.config.mode {
            Mode::Merge => Some(MediaTool::locate(&self.config.ffmpeg, &self.config.ffprobe)?),
            Mode::Rename => None,
        };

        let files = utils::scan_directory(input).map_err(|source| SetupError::Scan {
            path: input.clone(),
            source,
        })?;
        let groups = utils::group_files(files)?;
        log::debug!("Found {} recordings in {}", groups.len(), input.display());

        let output_dir = self.config.output_dir();
        fs::create_dir_all(&output_dir).map_err(|source| SetupError::CreateOutput {
            path: output_dir.clone(),
            source,
        })?;

        let mut summary = RunSummary {
            output_dir: output_dir.clone(),
            ..RunSummary::default()
        };

        match tool {
            Some(tool) => self.merge_groups(&tool, &groups, &output_dir, &mut summary),
            None => self.rename_groups(&groups, &output_dir, &mut summary),
        }

        Ok(summary)
    }

    fn rename_groups(
        &self,
        groups: &BTreeMap<String, VideoGroup>,
        output_dir: &Path,
        summary: &mut RunSummary,
    ) {
        for group in groups.values() {
            for (part, new_name) in group.renamed_targets() {
                let target = output_dir.join(&new_name);
                match copy_file(&part.path, &target) {
                    Ok(()) => {
                        self.report(&format!(
                            "Copied and renamed: {} -> {}",
                            file_name(&part.path),
                            new_name
                        ));
                        summary.written.push(target);
                    }
                    Err(error) => {
                        eprintln!(
                            "Error copying {} -> {}: {}",
                            file_name(&part.path),
                            new_name,
                            error
                        );
                        summary.failures.push(Failure {
                            video_id: group.video_id.clone(),
                            target,
                            error: ProduceError::Copy(error),
                        });
                    }
                }
            }
        }
    }

    fn merge_groups(
        &self,
        tool: &MediaTool,
        groups: &BTreeMap<String, VideoGroup>,
        output_dir: &Path,
        summary: &mut RunSummary,
    ) {
        let durations: BTreeMap<&str, Duration> = groups
            .values()
            .map(|group| (group.video_id.as_str(), group_duration(tool, group)))
            .collect();
        let total: Duration = durations.values().sum();

        let mut progress = MergeProgress::new(total, !self.config.quiet);

        for group in groups.values() {
            let duration = durations
                .get(group.video_id.as_str())
                .copied()
                .unwrap_or_default();
            let target = output_dir.join(group.merged_name());
            progress.start_group(&group.video_id);

            let result = if group.is_single() {
                copy_file(&group.parts[0].path, &target).map_err(ProduceError::Copy)
            } else {
                progress.suspend(|| {
                    self.report(&format!(
                        "Merging {} parts for video {}...",
                        group.parts.len(),
                        group.video_id
                    ))
                });
                tool.concat(&group.paths(), &target, |position| {
                    progress.update_within_group(position, duration)
                })
                .map(|()| copy_mtime(&group.parts[0].path, &target))
                .map_err(ProduceError::Merge)
            };

            match result {
                Ok(()) => {
                    progress.finish_group(duration);
                    let message = if group.is_single() {
                        format!(
                            "Copied single video: {} -> {}",
                            file_name(&group.parts[0].path),
                            file_name(&target)
                        )
                    } else {
                        format!("Successfully merged videos into: {}", target.display())
                    };
                    progress.suspend(|| self.report(&message));
                    summary.written.push(target);
                }
                Err(error) => {
                    progress.suspend(|| {
                        eprintln!(
                            "Error producing {} for video {}: {}",
                            file_name(&target),
                            group.video_id,
                            error_chain(&error)
                        )
                    });
                    summary.failures.push(Failure {
                        video_id: group.video_id.clone(),
                        target,
                        error,
                    });
                }
            }
        }

        summary.merged_duration = progress.finish();
    }

    fn report(&self, message: &str) {
        if !self.config.quiet {
            println!("{message}");
        }
    }
}

/// Sum of probed part durations. A part that cannot be probed counts as zero.
fn group_duration(tool: &MediaTool, group: &VideoGroup) -> Duration {
    group
        .parts
        .iter()
        .map(|part| {
            tool.probe_duration(&part.path).unwrap_or_else(|error| {
                log::warn!("{error}; progress will not include this file");
                Duration::ZERO
            })
        })
        .sum()
}

/// Byte-for-byte copy that overwrites `target`, keeping the source permissions and
/// modification time. The bytes go to a temporary file that only replaces `target` once
/// the copy is complete, so a failed copy leaves any earlier output as it was.
fn copy_file(source: &Path, target: &Path) -> io::Result<()> {
    let mut input = File::open(source)?;
    let metadata = input.metadata()?;

    let mut partial = tempfile::Builder::new()
        .prefix(".copying-")
        .tempfile_in(parent_dir(target))?;
    io::copy(&mut input, partial.as_file_mut())?;

    let mtime = FileTime::from_last_modification_time(&metadata);
    if let Err(error) = filetime::set_file_handle_times(partial.as_file(), None, Some(mtime)) {
        log::warn!("Could not keep modification time of {}: {error}", source.display());
    }
    partial.as_file().set_permissions(metadata.permissions())?;

    partial.persist(target).map_err(|error| error.error)?;
    Ok(())
}

/// Stamps a merged recording with the modification time of its first part.
fn copy_mtime(source: &Path, target: &Path) {
    let result = fs::metadata(source).and_then(|metadata| {
        filetime::set_file_mtime(target, FileTime::from_last_modification_time(&metadata))
    });
    if let Err(error) = result {
        log::warn!("Could not set modification time of {}: {error}", target.display());
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
