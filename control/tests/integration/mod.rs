//! Reconciler integration test framework
//!
//! Drives the controller end to end against in-memory resource caches, a
//! fake proxy manager and a recording reporter. Every scenario gets a fresh
//! context so state never leaks between them.
//!
//! ## Architecture
//!
//! - **framework/**: context, fixtures and assertion helpers
//! - **scenarios/**: one flow per file (simple site, mergeable site,
//!   endpoints, removal, secrets, VirtualServer)
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test integration_test
//! ```

// Allow clippy warnings for test code
#![allow(
    dead_code,
    clippy::expect_used,
    clippy::panic,
    clippy::unwrap_used
)]

pub mod framework;
pub mod scenarios;

pub use framework::{TestContext, TestResult};

use control::config::ControllerConfig;

/// Test scenario trait
///
/// Each test scenario implements this trait to integrate with the runner.
#[async_trait::async_trait(?Send)]
pub trait TestScenario {
    /// Scenario name (for logging)
    fn name(&self) -> &str;

    /// Controller settings the scenario runs with
    fn config(&self) -> ControllerConfig {
        ControllerConfig::default()
    }

    /// Run the test scenario
    async fn run(&self, ctx: &mut TestContext) -> TestResult;
}
