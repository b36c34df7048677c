//! Error types used by the stream engine.
//!
//! This module defines two main error enums:
//!
//! - [`FluxError`]: errors travelling through a pipeline as terminal `Error` signals.
//! - [`AssemblyError`]: errors raised while *building* a pipeline or a scheduler,
//!   before anything is subscribed.
//!
//! Both types provide helper methods (`as_label`, `as_message`) for logging/metrics.
//!
//! ## Taxonomy
//! ```text
//! protocol violations   ─► FluxError::Protocol      (fatal, never retried or resumed)
//! domain errors         ─► FluxError::Domain        (user code; recoverable via error operators)
//!                          FluxError::Wrapped       (mapped error, original cause preserved)
//! timeout/cancellation  ─► FluxError::Timeout / Canceled
//! assembly-time errors  ─► AssemblyError            (returned synchronously, no subscription)
//! ```

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Boxed error accepted from user closures (`try_map`, `from_callable`, ...).
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// # Errors delivered through the `Error` signal.
///
/// `FluxError` is cheap to clone: user errors are kept behind an `Arc` so the
/// same error instance can be observed by several operators (e.g. `merge`
/// cancelling its siblings, `share` fanning out a terminal signal).
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum FluxError {
    /// Error raised by user code. The original value is preserved and can be
    /// recovered with [`FluxError::downcast_ref`].
    #[error(transparent)]
    Domain(Arc<dyn StdError + Send + Sync + 'static>),

    /// An error replaced by a higher-level one, keeping the original as its cause.
    #[error("{message}")]
    Wrapped {
        /// Message of the outer error.
        message: Arc<str>,
        /// The error that was mapped.
        #[source]
        source: Box<FluxError>,
    },

    /// No signal arrived within the configured duration.
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// The subscription was cancelled before it could terminate.
    #[error("subscription cancelled")]
    Canceled,

    /// An item could not be delivered because the consumer granted no demand.
    #[error("overflow: {reason}")]
    Overflow {
        /// What could not be emitted.
        reason: Arc<str>,
    },

    /// A scheduler refused a task (disposed, or delays unsupported).
    #[error("scheduler '{scheduler}' rejected task: {reason}")]
    Rejected {
        /// Name of the scheduler.
        scheduler: Arc<str>,
        /// Why the task was rejected.
        reason: &'static str,
    },

    /// Retries with backoff ran out.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Number of resubscriptions performed.
        attempts: u32,
        /// The last error observed.
        #[source]
        source: Box<FluxError>,
    },

    /// A producer or consumer broke the signal protocol. Not recoverable.
    #[error("protocol violation ({rule}): {detail}")]
    Protocol {
        /// Short name of the broken rule.
        rule: &'static str,
        /// Details about the violation.
        detail: String,
    },

    /// A blocking adapter was called from a thread that must not block.
    #[error("blocking call on non-blocking thread '{thread}'")]
    Blocking {
        /// Name of the offending thread.
        thread: String,
    },
}

/// Plain message error used by [`FluxError::msg`].
#[derive(Error, Debug)]
#[error("{0}")]
struct MessageError(String);

impl FluxError {
    /// Wraps a user error.
    ///
    /// ```
    /// use rivulet::FluxError;
    ///
    /// let err = FluxError::domain(std::io::Error::other("disk full"));
    /// assert!(err.downcast_ref::<std::io::Error>().is_some());
    /// ```
    pub fn domain<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        FluxError::Domain(Arc::new(error))
    }

    /// Creates a domain error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        FluxError::Domain(Arc::new(MessageError(message.into())))
    }

    /// Converts a boxed error, unwrapping it if it already is a `FluxError`.
    pub fn from_boxed(error: BoxError) -> Self {
        match error.downcast::<FluxError>() {
            Ok(flux) => *flux,
            Err(other) => FluxError::Domain(Arc::from(other)),
        }
    }

    /// Replaces this error with a new message, keeping `self` as the cause.
    pub fn wrap(self, message: impl Into<Arc<str>>) -> Self {
        FluxError::Wrapped {
            message: message.into(),
            source: Box::new(self),
        }
    }

    /// Creates a protocol violation error.
    pub(crate) fn protocol(rule: &'static str, detail: impl Into<String>) -> Self {
        FluxError::Protocol {
            rule,
            detail: detail.into(),
        }
    }

    /// Creates an overflow error.
    pub(crate) fn overflow(reason: impl Into<Arc<str>>) -> Self {
        FluxError::Overflow {
            reason: reason.into(),
        }
    }

    /// Walks `Wrapped` and `RetryExhausted` layers down to the original error.
    pub fn root_cause(&self) -> &FluxError {
        let mut current = self;
        loop {
            match current {
                FluxError::Wrapped { source, .. } | FluxError::RetryExhausted { source, .. } => {
                    current = source;
                }
                other => return other,
            }
        }
    }

    /// Returns the user error of type `E`, looking through wrapping layers.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self.root_cause() {
            FluxError::Domain(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use rivulet::FluxError;
    /// use std::time::Duration;
    ///
    /// let err = FluxError::Timeout { timeout: Duration::from_secs(1) };
    /// assert_eq!(err.as_label(), "flux_timeout");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            FluxError::Domain(_) => "flux_domain",
            FluxError::Wrapped { .. } => "flux_wrapped",
            FluxError::Timeout { .. } => "flux_timeout",
            FluxError::Canceled => "flux_canceled",
            FluxError::Overflow { .. } => "flux_overflow",
            FluxError::Rejected { .. } => "flux_rejected",
            FluxError::RetryExhausted { .. } => "flux_retry_exhausted",
            FluxError::Protocol { .. } => "flux_protocol",
            FluxError::Blocking { .. } => "flux_blocking",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            FluxError::Domain(inner) => format!("error: {inner}"),
            FluxError::Wrapped { message, source } => format!("{message} (caused by: {source})"),
            FluxError::Timeout { timeout } => format!("timeout: {timeout:?}"),
            FluxError::Canceled => "subscription cancelled".to_string(),
            FluxError::Overflow { reason } => format!("overflow: {reason}"),
            FluxError::Rejected { scheduler, reason } => {
                format!("rejected by {scheduler}: {reason}")
            }
            FluxError::RetryExhausted { attempts, source } => {
                format!("retry exhausted after {attempts}: {source}")
            }
            FluxError::Protocol { rule, detail } => format!("protocol {rule}: {detail}"),
            FluxError::Blocking { thread } => format!("blocking on {thread}"),
        }
    }

    /// True for [`FluxError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, FluxError::Timeout { .. })
    }

    /// True for timeout and cancellation kinds, which callers usually special-case.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, FluxError::Timeout { .. } | FluxError::Canceled)
    }

    /// True for protocol violations.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FluxError::Protocol { .. })
    }

    /// Indicates whether resubscribing may succeed.
    ///
    /// Returns `true` for domain, wrapped, overflow and timeout errors,
    /// `false` otherwise.
    ///
    /// ```
    /// use rivulet::FluxError;
    ///
    /// assert!(FluxError::msg("boom").is_retryable());
    /// assert!(!FluxError::Canceled.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FluxError::Domain(_)
                | FluxError::Wrapped { .. }
                | FluxError::Overflow { .. }
                | FluxError::Timeout { .. }
        )
    }
}

/// # Errors raised while assembling a pipeline or a scheduler.
///
/// These fail immediately at construction time, before any subscription exists.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AssemblyError {
    /// An argument was outside its allowed range.
    #[error("invalid argument {name}={value}: {reason}")]
    InvalidArgument {
        /// Argument name.
        name: &'static str,
        /// Rejected value.
        value: String,
        /// Constraint that was violated.
        reason: &'static str,
    },

    /// The runtime backing a scheduler could not be started.
    #[error("failed to start runtime for scheduler '{name}': {source}")]
    Runtime {
        /// Scheduler name.
        name: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl AssemblyError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            AssemblyError::InvalidArgument { .. } => "assembly_invalid_argument",
            AssemblyError::Runtime { .. } => "assembly_runtime",
        }
    }

    pub(crate) fn positive(name: &'static str, value: usize) -> Result<usize, Self> {
        if value == 0 {
            Err(AssemblyError::InvalidArgument {
                name,
                value: value.to_string(),
                reason: "must be greater than zero",
            })
        } else {
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("invalid number: {0}")]
    struct InvalidNumber(i32);

    #[test]
    fn domain_error_keeps_identity_through_wrapping() {
        let err = FluxError::domain(InvalidNumber(4)).wrap("unexpected exception");
        assert_eq!(err.to_string(), "unexpected exception");
        assert_eq!(err.downcast_ref::<InvalidNumber>().map(|e| e.0), Some(4));
        assert_eq!(err.root_cause().to_string(), "invalid number: 4");
    }

    #[test]
    fn from_boxed_does_not_double_wrap() {
        let boxed: BoxError = Box::new(FluxError::Canceled);
        assert!(matches!(FluxError::from_boxed(boxed), FluxError::Canceled));

        let boxed: BoxError = "plain".into();
        let err = FluxError::from_boxed(boxed);
        assert_eq!(err.as_label(), "flux_domain");
        assert_eq!(err.to_string(), "plain");
    }

    #[test]
    fn kinds_are_distinguishable() {
        let timeout = FluxError::Timeout {
            timeout: Duration::from_millis(5),
        };
        assert!(timeout.is_timeout());
        assert!(timeout.is_cancellation());
        assert!(!FluxError::msg("x").is_cancellation());
        assert!(FluxError::protocol("rule", "detail").is_fatal());
        assert!(!FluxError::protocol("rule", "detail").is_retryable());
    }

    #[test]
    fn assembly_positive_rejects_zero() {
        assert!(AssemblyError::positive("concurrency", 0).is_err());
        assert_eq!(AssemblyError::positive("concurrency", 3).ok(), Some(3));
    }
}
