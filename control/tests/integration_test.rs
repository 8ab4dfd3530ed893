//! Reconciler Integration Tests
//!
//! Run with: cargo test --test integration_test

#![allow(clippy::expect_used, clippy::panic)]

mod integration;

use integration::scenarios::cafe::CafeScenario;
use integration::scenarios::endpoints::{EndpointSliceScenario, PlusEndpointScenario};
use integration::scenarios::mergeable::MergeableScenario;
use integration::scenarios::removal::RemovalScenario;
use integration::scenarios::secrets::SecretLifecycleScenario;
use integration::scenarios::virtual_server::VirtualServerScenario;
use integration::{TestContext, TestScenario};

#[tokio::test]
async fn run_integration_tests() {
    // Register test scenarios
    let scenarios: Vec<Box<dyn TestScenario>> = vec![
        Box::new(CafeScenario),
        Box::new(MergeableScenario),
        Box::new(EndpointSliceScenario),
        Box::new(PlusEndpointScenario),
        Box::new(RemovalScenario),
        Box::new(SecretLifecycleScenario),
        Box::new(VirtualServerScenario),
    ];

    let mut passed = 0;
    let mut failed = 0;

    for scenario in scenarios {
        println!("🏃 Running scenario: {}", scenario.name());

        // Fresh caches, proxy and reporter per scenario
        let mut ctx = TestContext::new(scenario.config());

        match scenario.run(&mut ctx).await {
            Ok(()) => {
                println!("✅ Scenario passed: {}\n", scenario.name());
                passed += 1;
            }
            Err(e) => {
                eprintln!("❌ Scenario failed: {}", scenario.name());
                eprintln!("   Error: {}\n", e);
                failed += 1;
            }
        }
    }

    println!("📊 Results: {} passed, {} failed", passed, failed);
    if failed > 0 {
        panic!("{} integration scenario(s) failed", failed);
    }
}
