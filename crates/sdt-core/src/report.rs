//! Progress and warning plumbing shared by the workflows.

use tracing::warn;

/// Receives progress updates as `(done, total, label)`.
///
/// Any matching closure works: `&|done, total, _| bar.set_position(done)`.
pub trait Progress: Send + Sync {
    fn update(&self, done: u64, total: u64, label: &str);
}

impl<F> Progress for F
where
    F: Fn(u64, u64, &str) + Send + Sync,
{
    fn update(&self, done: u64, total: u64, label: &str) {
        self(done, total, label)
    }
}

/// Non-fatal conditions collected during a workflow run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Warnings(Vec<String>);

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning and log it.
    pub fn push(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!("{msg}");
        self.0.push(msg);
    }

    pub fn extend(&mut self, other: Warnings) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}
