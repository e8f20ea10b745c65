//! Progress bars for paged reads, writes and verifies

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use avrflash_core::progress::Progress;
use indicatif::{ProgressBar, ProgressStyle};

/// indicatif progress bar on stderr that also reports SIGINT
pub struct BarProgress {
    bar: Option<ProgressBar>,
    hidden: bool,
    cancel: Arc<AtomicBool>,
}

impl BarProgress {
    /// Create a reporter; `hidden` suppresses the bars but keeps the cancel flag
    pub fn new(hidden: bool, cancel: Arc<AtomicBool>) -> Self {
        Self { bar: None, hidden, cancel }
    }
}

fn style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{msg:9} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

impl Progress for BarProgress {
    fn start(&mut self, label: &str, total: usize) {
        if let Some(old) = self.bar.take() {
            old.finish_and_clear();
        }
        if self.hidden {
            return;
        }
        let pb = ProgressBar::new(total as u64);
        pb.set_style(style());
        pb.set_message(label.to_string());
        self.bar = Some(pb);
    }

    fn update(&mut self, done: usize) {
        if let Some(pb) = &self.bar {
            pb.set_position(done as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = self.bar.take() {
            pb.finish();
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut p = BarProgress::new(true, Arc::clone(&flag));
        p.start("Writing", 100);
        p.update(50);
        assert!(!p.cancelled());
        flag.store(true, Ordering::Relaxed);
        assert!(p.cancelled());
        p.finish();
    }
}
