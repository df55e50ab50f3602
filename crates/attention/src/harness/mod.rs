//! Correctness harness for [`FlashKernel`](crate::core::FlashKernel)
//! implementations.
//!
//! Four suites sweep the kernel family: dense, fp8, varlen and flex. Each
//! case builds seeded random inputs, runs the kernel and judges its error
//! relative to a low-precision evaluation of the exact reference. Results are
//! collected into [`SuiteReport`]s and optionally written as markdown.

pub mod cases;
pub mod config;
pub mod inputs;
pub mod report;
pub mod runner;
pub mod tolerance;

pub use cases::{ElementType, MhaType, Suite};
pub use config::HarnessConfig;
pub use report::{CaseOutcome, CaseReport, SuiteReport};
pub use runner::Harness;
pub use tolerance::{DiffStats, ErrorBudget};
