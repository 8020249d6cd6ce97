use std::fmt;

/// Where a server is in its lifecycle.
///
/// Transitions only move forward:
/// `Idle -> Starting -> Ready -> Stopping -> Closed`, with `Failed`
/// reachable from `Starting` when the listener cannot be bound.
/// A server that never started goes straight from `Idle` to `Stopping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Starting,
    Ready,
    Failed,
    Stopping,
    Closed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Ready => "ready",
            Phase::Failed => "failed",
            Phase::Stopping => "stopping",
            Phase::Closed => "closed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
