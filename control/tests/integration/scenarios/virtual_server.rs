//! VirtualServer Test
//!
//! A VirtualServer delegating /coffee to a VirtualServerRoute renders one
//! config with upstreams from both. A route for another host is ignored on
//! both sides while the VirtualServer stays live.

use super::super::framework::assertions::{ensure, ensure_eq, outcomes};
use super::super::framework::{fixtures, key, TestContext, TestResult};
use super::super::TestScenario;
use control::reconcile::reporter::{Outcome, ResourceKind};
use control::reconcile::task_queue::TaskKind;

const CONFIG_NAME: &str = "vs_default_cafe";

pub struct VirtualServerScenario;

#[async_trait::async_trait(?Send)]
impl TestScenario for VirtualServerScenario {
    fn name(&self) -> &str {
        "virtual_server"
    }

    async fn run(&self, ctx: &mut TestContext) -> TestResult {
        println!("\n🧪 Running VirtualServer Scenarios");

        test_route_merged(ctx).await?;
        test_route_for_other_host(ctx).await?;
        test_deleted(ctx).await?;

        println!("✅ All VirtualServer tests passed!\n");
        Ok(())
    }
}

/// Test 1: /tea from the VirtualServer, /coffee from the route
async fn test_route_merged(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: VirtualServer with one route");

    for service in ["tea-svc", "coffee-svc"] {
        ctx.stores.services.apply(fixtures::service(service));
    }
    ctx.stores
        .endpoint_slices
        .apply(fixtures::endpoint_slice("coffee-svc", &["10.0.1.1"]));
    ctx.stores
        .virtual_servers
        .apply(fixtures::cafe_virtual_server());
    ctx.stores
        .virtual_server_routes
        .apply(fixtures::coffee_route("cafe.example.com"));

    ctx.sync(TaskKind::VirtualServer, "cafe").await;

    let config = ctx.virtual_server_config(CONFIG_NAME)?;
    ensure_eq(config.server.server_name.as_str(), "cafe.example.com", "server name")?;

    let mut upstreams: Vec<&str> = config.upstreams.iter().map(|u| u.name.as_str()).collect();
    upstreams.sort();
    ensure_eq(
        upstreams,
        vec!["vs_default_cafe_tea", "vs_default_cafe_vsr_default_coffee_coffee"],
        "upstreams",
    )?;

    let coffee = config
        .server
        .locations
        .iter()
        .find(|l| l.path == "/coffee")
        .ok_or("/coffee location is missing")?;
    ensure_eq(
        coffee.route.as_ref().map(|r| r.name.as_str()),
        Some("coffee"),
        "/coffee route",
    )?;

    ensure_eq(
        outcomes(&ctx.reporter, ResourceKind::VirtualServer, "cafe"),
        vec![Outcome::AddedOrUpdated],
        "VirtualServer outcomes",
    )?;
    ensure_eq(
        outcomes(&ctx.reporter, ResourceKind::VirtualServerRoute, "coffee"),
        vec![Outcome::AddedOrUpdated],
        "route outcomes",
    )?;

    println!("  ✅ One config, upstreams from both");
    Ok(())
}

/// Test 2: the route moves to another host
async fn test_route_for_other_host(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: Route for another host");

    ctx.reporter.clear();
    ctx.stores
        .virtual_server_routes
        .apply(fixtures::coffee_route("tea.example.com"));

    // The route task only points at the VirtualServer using it
    ctx.sync(TaskKind::VirtualServerRoute, "coffee").await;
    ensure_eq(ctx.drain().await, 1, "VirtualServer resyncs")?;

    ensure_eq(
        outcomes(&ctx.reporter, ResourceKind::VirtualServer, "cafe"),
        vec![Outcome::Ignored, Outcome::AddedOrUpdatedWithWarning],
        "VirtualServer outcomes",
    )?;
    ensure_eq(
        outcomes(&ctx.reporter, ResourceKind::VirtualServerRoute, "coffee"),
        vec![Outcome::Ignored],
        "route outcomes",
    )?;

    let config = ctx.virtual_server_config(CONFIG_NAME)?;
    ensure(
        !config
            .upstreams
            .iter()
            .any(|u| u.name.contains("_vsr_default_coffee_")),
        "Ignored route still contributes upstreams",
    )?;
    ensure(
        ctx.controller.configurator().has_virtual_server(&key("cafe")),
        "VirtualServer is no longer live",
    )?;

    println!("  ✅ Route ignored, VirtualServer live");
    Ok(())
}

/// Test 3: deleting the VirtualServer removes its only artifact, no reload
async fn test_deleted(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: VirtualServer deleted");

    ctx.proxy.clear_calls();
    ctx.stores.virtual_servers.delete(&key("cafe"));
    ctx.sync(TaskKind::VirtualServer, "cafe").await;

    ensure(ctx.proxy.config(CONFIG_NAME).is_none(), "Artifact remains")?;
    ensure_eq(ctx.proxy.reload_count(), 0, "reloads")?;

    println!("  ✅ Removed");
    Ok(())
}
