//! Structured error types for the simulation kernel.
//!
//! All fallible public APIs return `Result<T, KernelError>`. Programmer
//! errors (bad delays, out-of-order recording, queries into undefined
//! history) fail fast. Cancellation is the one condition a suspended
//! process is expected to observe.

/// The top-level error type for the simulation kernel.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    // ── Scheduling errors ─────────────────────────────────

    /// A notification delay was negative (or NaN).
    #[error("notification delay must be a non-negative number, got {delay}")]
    NegativeDelay { delay: f64 },

    /// An event or signal was used after its event loop was dropped.
    #[error("the owning event loop has been dropped")]
    LoopDropped,

    // ── Trace errors ──────────────────────────────────────

    /// A sample was recorded at a time before the last recorded sample.
    #[error("trace '{trace}' must record in non-decreasing time: T={time} after T={last}")]
    NonMonotonicRecord { trace: String, time: f64, last: f64 },

    /// A trace was queried at a time for which it holds no history.
    #[error("trace '{trace}' has no recorded history at T={time}")]
    UndefinedHistory { trace: String, time: f64 },

    // ── Process errors ────────────────────────────────────

    /// A suspended process was resumed after an event-loop reset.
    #[error("process cancelled by event-loop reset")]
    Cancelled,
}

impl KernelError {
    /// Returns `true` for the cancellation condition.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, KernelError::Cancelled)
    }
}

/// Convenience alias for `Result<T, KernelError>`.
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_negative_delay() {
        let e = KernelError::NegativeDelay { delay: -1.5 };
        assert!(e.to_string().contains("-1.5"));
    }

    #[test]
    fn test_error_display_non_monotonic() {
        let e = KernelError::NonMonotonicRecord {
            trace: "clk".into(),
            time: 3.0,
            last: 8.0,
        };
        let s = e.to_string();
        assert!(s.contains("'clk'"));
        assert!(s.contains("T=3"));
        assert!(s.contains("T=8"));
    }

    #[test]
    fn test_error_display_undefined_history() {
        let e = KernelError::UndefinedHistory { trace: "sig".into(), time: 0.5 };
        assert!(e.to_string().contains("no recorded history"));
    }

    #[test]
    fn test_is_cancelled() {
        assert!(KernelError::Cancelled.is_cancelled());
        assert!(!KernelError::LoopDropped.is_cancelled());
    }

    #[test]
    fn test_error_is_std_error() {
        let e: Box<dyn std::error::Error> = Box::new(KernelError::Cancelled);
        assert!(!e.to_string().is_empty());
    }
}
