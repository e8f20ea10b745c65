//! Progress reporting for long memory operations

/// Callback for progress reporting during reads, writes and verifies
pub trait Progress {
    /// Called when an operation over `total` units starts
    fn start(&mut self, label: &str, total: usize);

    /// Called with the number of units done so far
    fn update(&mut self, done: usize);

    /// Called when the operation ends, successfully or not
    fn finish(&mut self);

    /// True if the user asked to stop; paged loops check this between pages
    fn cancelled(&self) -> bool {
        false
    }
}

/// A no-op progress reporter
pub struct NoProgress;

impl Progress for NoProgress {
    fn start(&mut self, _label: &str, _total: usize) {}
    fn update(&mut self, _done: usize) {}
    fn finish(&mut self) {}
}
