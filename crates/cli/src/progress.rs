//! Progress bars for sync stages.

use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use pagesync_core::ProgressReporter;

/// One bar per stage, drawn on stderr.
pub struct BarProgress {
    bar: Mutex<Option<ProgressBar>>,
    visible: bool,
}

impl BarProgress {
    /// Bars are drawn only when `visible` and stderr is a terminal.
    pub fn new(visible: bool) -> Self {
        Self {
            bar: Mutex::new(None),
            visible: visible && console::Term::stderr().is_term(),
        }
    }

    fn current(&self) -> std::sync::MutexGuard<'_, Option<ProgressBar>> {
        self.bar.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProgressReporter for BarProgress {
    fn stage(&self, name: &str, total: usize) {
        let mut current = self.current();
        if let Some(done) = current.take() {
            done.finish_and_clear();
        }
        if !self.visible || total == 0 {
            return;
        }
        let bar = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::stderr());
        let style = ProgressStyle::with_template(
            "{spinner:.blue} {prefix:>12.bold} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        bar.set_style(style);
        bar.set_prefix(name.to_string());
        bar.enable_steady_tick(std::time::Duration::from_millis(100));
        *current = Some(bar);
    }

    fn item_done(&self, id: &str, ok: bool) {
        if let Some(bar) = self.current().as_ref() {
            if !ok {
                bar.set_message(format!("last failure: {id}"));
            }
            bar.inc(1);
        }
    }

    fn finish(&self) {
        if let Some(bar) = self.current().take() {
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_progress_ignores_events() {
        let progress = BarProgress::new(false);
        progress.stage("pull", 3);
        progress.item_done("1", true);
        progress.item_done("2", false);
        assert!(progress.current().is_none());
        progress.finish();
    }
}
