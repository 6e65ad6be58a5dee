//! Cooperative readiness without an async runtime.

/// Result of a handler step that may need another `poll()` cycle.
///
/// `Pending` means "call me again next loop"; there is no waker and no
/// implicit state capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult<T> {
    Ready(T),
    Pending,
}

impl<T> PollResult<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> PollResult<U> {
        match self {
            Self::Ready(v) => PollResult::Ready(f(v)),
            Self::Pending => PollResult::Pending,
        }
    }
}

impl<T> From<T> for PollResult<T> {
    fn from(value: T) -> Self {
        Self::Ready(value)
    }
}
