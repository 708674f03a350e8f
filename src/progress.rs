use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const BAR_TEMPLATE: &str =
    "{msg:12} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% ETA {eta}";
const BAR_CHARS: &str = "##-";

/// Tracks merged media time across groups, measured against the probed total.
///
/// The bar length is the total in milliseconds. `completed` only grows when a group
/// finishes; positions reported from inside a running group are drawn on top of it.
pub struct MergeProgress {
    bar: ProgressBar,
    completed: Duration,
}

impl MergeProgress {
    pub fn new(total: Duration, visible: bool) -> Self {
        let bar = ProgressBar::with_draw_target(
            Some(as_millis(total)),
            if visible {
                ProgressDrawTarget::stderr()
            } else {
                ProgressDrawTarget::hidden()
            },
        );
        if let Ok(style) = ProgressStyle::with_template(BAR_TEMPLATE) {
            bar.set_style(style.progress_chars(BAR_CHARS));
        }

        Self {
            bar,
            completed: Duration::ZERO,
        }
    }

    pub fn start_group(&self, video_id: &str) {
        self.bar.set_message(video_id.to_string());
    }

    /// `position` is how far ffmpeg has written into the current group.
    pub fn update_within_group(&self, position: Duration, group_duration: Duration) {
        let position = position.min(group_duration);
        self.bar.set_position(as_millis(self.completed + position));
    }

    pub fn finish_group(&mut self, group_duration: Duration) {
        self.completed += group_duration;
        self.bar.set_position(as_millis(self.completed));
    }

    #[cfg(test)]
    pub fn completed(&self) -> Duration {
        self.completed
    }

    pub fn suspend<F: FnOnce() -> R, R>(&self, f: F) -> R {
        self.bar.suspend(f)
    }

    pub fn finish(self) -> Duration {
        self.bar.finish_and_clear();
        self.completed
    }
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
