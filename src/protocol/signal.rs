//! # Signals delivered to a subscriber.
//!
//! Every subscription sees the same grammar:
//!
//! ```text
//! on_subscribe ─► Next* ─► (Error | Complete)?
//! ```
//!
//! [`Signal`] is the closed set of data signals; [`SignalType`] additionally
//! names the control-path events (`request`, `cancel`) for operators that
//! observe the whole lifecycle (`do_finally`, `log`).

use std::fmt;

use crate::error::FluxError;

/// A data or terminal signal.
#[derive(Debug, Clone)]
pub enum Signal<T> {
    /// One item. Only ever emitted against granted demand.
    Next(T),
    /// Terminal failure.
    Error(FluxError),
    /// Terminal success.
    Complete,
}

impl<T> Signal<T> {
    /// True for `Error` and `Complete`.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Signal::Next(_))
    }

    /// Returns the kind of this signal.
    pub fn signal_type(&self) -> SignalType {
        match self {
            Signal::Next(_) => SignalType::OnNext,
            Signal::Error(_) => SignalType::OnError,
            Signal::Complete => SignalType::OnComplete,
        }
    }

    /// Maps the item, leaving terminal signals untouched.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Signal<U> {
        match self {
            Signal::Next(v) => Signal::Next(f(v)),
            Signal::Error(e) => Signal::Error(e),
            Signal::Complete => Signal::Complete,
        }
    }

    /// Returns the item, if any.
    pub fn into_next(self) -> Option<T> {
        match self {
            Signal::Next(v) => Some(v),
            _ => None,
        }
    }
}

impl<T: PartialEq> PartialEq for Signal<T> {
    /// Errors compare by label and message since `FluxError` carries trait objects.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Signal::Next(a), Signal::Next(b)) => a == b,
            (Signal::Error(a), Signal::Error(b)) => {
                a.as_label() == b.as_label() && a.to_string() == b.to_string()
            }
            (Signal::Complete, Signal::Complete) => true,
            _ => false,
        }
    }
}

/// Every observable event of a subscription, data and control path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalType {
    OnSubscribe,
    Request,
    OnNext,
    OnError,
    OnComplete,
    Cancel,
}

impl SignalType {
    /// Returns a stable label (snake_case).
    pub fn as_label(&self) -> &'static str {
        match self {
            SignalType::OnSubscribe => "on_subscribe",
            SignalType::Request => "request",
            SignalType::OnNext => "on_next",
            SignalType::OnError => "on_error",
            SignalType::OnComplete => "on_complete",
            SignalType::Cancel => "cancel",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(!Signal::Next(1).is_terminal());
        assert!(Signal::<i32>::Complete.is_terminal());
        assert!(Signal::<i32>::Error(FluxError::Canceled).is_terminal());
        assert_eq!(Signal::Next(2).map(|v| v * 10).into_next(), Some(20));
        assert_eq!(
            Signal::<i32>::Error(FluxError::msg("x")).signal_type(),
            SignalType::OnError
        );
    }
}
