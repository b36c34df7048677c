//! # Test harness.
//!
//! - [`StepVerifier`]: scripted expectations against one subscription, with
//!   optional virtual time and per-run dropped-signal recording.
//! - [`TestPublisher`]: a manually driven source (hot, cold or deliberately
//!   non-compliant).
//! - [`PublisherProbe`]: records subscribe / request / cancel on a flux.
//!
//! ```
//! use rivulet::Flux;
//! use rivulet::testing::StepVerifier;
//!
//! StepVerifier::create_with_demand(Flux::range(1, 3), 1)
//!     .expect_next(1)
//!     .then_request(2)
//!     .expect_next_sequence([2, 3])
//!     .verify_complete()
//!     .unwrap();
//! ```

mod probe;
mod publisher;
mod step_verifier;

pub use probe::PublisherProbe;
pub use publisher::TestPublisher;
pub use step_verifier::{
    Assertions, ContextExpectations, StepVerifier, StepVerifierOptions, Verification, VerifyError,
};
