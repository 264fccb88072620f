//! Execution limits for non-terminating or runaway programs.

use std::fmt;

/// What ran out when a limit fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LimitKind {
    Steps,
    CallDepth,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steps => write!(f, "step limit"),
            Self::CallDepth => write!(f, "call depth limit"),
        }
    }
}

/// Optional bounds checked by the block dispatcher. `Limits::none()` costs a
/// pair of `Option` tests per statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    pub max_steps: Option<u64>,
    pub max_call_depth: Option<usize>,
}

impl Limits {
    /// No bounds at all.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn new(max_steps: Option<u64>, max_call_depth: Option<usize>) -> Self {
        Self {
            max_steps,
            max_call_depth,
        }
    }

    /// Returns which limit `steps`/`depth` exceed, if any.
    #[must_use]
    pub fn exceeded(&self, steps: u64, depth: usize) -> Option<LimitKind> {
        if let Some(max) = self.max_steps
            && steps > max
        {
            return Some(LimitKind::Steps);
        }
        if let Some(max) = self.max_call_depth
            && depth > max
        {
            return Some(LimitKind::CallDepth);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_fires() {
        let limits = Limits::none();
        assert_eq!(limits.exceeded(u64::MAX, usize::MAX), None);
    }

    #[test]
    fn step_limit_fires_first() {
        let limits = Limits::new(Some(10), Some(4));
        assert_eq!(limits.exceeded(11, 0), Some(LimitKind::Steps));
        assert_eq!(limits.exceeded(0, 5), Some(LimitKind::CallDepth));
        assert_eq!(limits.exceeded(10, 4), None);
    }
}
