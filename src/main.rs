use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

mod ffmpeg;
mod organizer;
mod progress;
mod utils;

use organizer::{Config, Mode, Organizer, RunSummary};

/// Renames chaptered GoPro recordings into `{video}_{part}` names, or joins the chapters
/// of each recording into one file without re-encoding.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory containing the GoPro files
    #[arg(short, long, default_value = ".", value_parser = validate_directory)]
    input: PathBuf,

    /// Merge the parts of each video into one file instead of copying them individually
    #[arg(short, long, default_value_t = false)]
    merge: bool,

    /// Directory where processed files end up. By default a `processed_videos` directory
    /// inside the input directory.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// ffmpeg executable used for merging
    #[arg(long, env = "GOPRO_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// ffprobe executable used to read durations for the progress bar
    #[arg(long, env = "GOPRO_FFPROBE", default_value = "ffprobe")]
    ffprobe: PathBuf,

    /// Verbose mode
    #[arg(short, long, default_value_t = false, conflicts_with = "quiet")]
    verbose: bool,

    /// Only print errors
    #[arg(short, long, default_value_t = false)]
    quiet: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = Config {
        input: args.input,
        output: args.output,
        mode: if args.merge { Mode::Merge } else { Mode::Rename },
        ffmpeg: args.ffmpeg,
        ffprobe: args.ffprobe,
        quiet: args.quiet,
    };

    if !config.quiet {
        println!("Processing files in directory: {}", config.input.display());
    }

    match organize(config.clone()) {
        Ok(summary) if summary.is_success() => {
            if !config.quiet {
                println!(
                    "Done! {} files written to {}",
                    summary.written.len(),
                    summary.output_dir.display()
                );
                if !summary.merged_duration.is_zero() {
                    println!(
                        "Merged {:.1} seconds of footage",
                        summary.merged_duration.as_secs_f64()
                    );
                }
            }
            ExitCode::SUCCESS
        }
        Ok(summary) => {
            eprintln!(
                "Finished with {} failure(s); {} files written to {}",
                summary.failures.len(),
                summary.written.len(),
                summary.output_dir.display()
            );
            for failure in &summary.failures {
                eprintln!(
                    "  video {}: {}: {}",
                    failure.video_id,
                    failure.target.display(),
                    organizer::error_chain(&failure.error)
                );
            }
            ExitCode::from(1)
        }
        Err(error) => {
            eprintln!("Error: {error:#}");
            ExitCode::from(2)
        }
    }
}

fn organize(config: Config) -> anyhow::Result<RunSummary> {
    let input = config.input.clone();
    Organizer::new(config)
        .run()
        .with_context(|| format!("nothing was processed in {}", input.display()))
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
}

fn validate_directory(path: &str) -> Result<PathBuf, String> {
    if Path::new(path).is_dir() {
        Ok(PathBuf::from(path))
    } else {
        Err(format!("'{}' is not a valid directory path", path))
    }
}
