//! EndpointSlice Update Test
//!
//! Validates that endpoint changes reach the live site: a full apply on the
//! open-source proxy, the upstream API on Plus with exactly one full apply
//! when that API fails.

use super::super::framework::assertions::{ensure, ensure_eq, outcomes, upstream_endpoints};
use super::super::framework::{fixtures, TestContext, TestResult};
use super::super::TestScenario;
use control::config::ControllerConfig;
use control::proxy::fake::ManagerCall;
use control::reconcile::reporter::{Outcome, ResourceKind};
use control::reconcile::task_queue::TaskKind;

const CONFIG_NAME: &str = "default-tea";
const UPSTREAM: &str = "default-tea-tea.example.com-tea-svc-80";

fn seed(ctx: &TestContext) {
    ctx.stores.services.apply(fixtures::service("tea-svc"));
    ctx.stores
        .ingresses
        .apply(fixtures::simple_ingress("tea", "tea.example.com", "tea-svc"));
}

fn set_endpoints(ctx: &TestContext, addresses: &[&str]) {
    ctx.stores
        .endpoint_slices
        .apply(fixtures::endpoint_slice("tea-svc", addresses));
}

pub struct EndpointSliceScenario;

#[async_trait::async_trait(?Send)]
impl TestScenario for EndpointSliceScenario {
    fn name(&self) -> &str {
        "endpointslice_updates"
    }

    async fn run(&self, ctx: &mut TestContext) -> TestResult {
        println!("\n🧪 Running EndpointSlice Update Scenarios");

        test_no_endpoints(ctx).await?;
        test_scale_up(ctx).await?;
        test_unrelated_service(ctx).await?;

        println!("✅ All EndpointSlice tests passed!\n");
        Ok(())
    }
}

/// Test 1: a service without endpoints still gets a site, served by the
/// 502 sentinel
async fn test_no_endpoints(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: No endpoints yet");

    seed(ctx);
    ctx.sync(TaskKind::Ingress, "tea").await;

    let config = ctx.ingress_config(CONFIG_NAME)?;
    ensure_eq(
        upstream_endpoints(&config, "tea-svc-80")?,
        vec!["127.0.0.1:8181".to_string()],
        "sentinel member",
    )?;
    ensure_eq(
        outcomes(&ctx.reporter, ResourceKind::Ingress, "tea"),
        vec![Outcome::AddedOrUpdated],
        "outcomes",
    )?;

    println!("  ✅ Sentinel upstream");
    Ok(())
}

/// Test 2: new endpoints are a full apply on the open-source proxy
async fn test_scale_up(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: Scale Up (0 → 2 endpoints)");

    ctx.proxy.clear_calls();
    set_endpoints(ctx, &["10.0.0.1", "10.0.0.2"]);
    ctx.sync(TaskKind::Endpoints, "tea-svc").await;

    let config = ctx.ingress_config(CONFIG_NAME)?;
    ensure_eq(
        upstream_endpoints(&config, "tea-svc-80")?,
        vec!["10.0.0.1:8080".to_string(), "10.0.0.2:8080".to_string()],
        "members",
    )?;
    ensure_eq(
        ctx.proxy.calls(),
        vec![ManagerCall::WriteConfig(CONFIG_NAME.to_string()), ManagerCall::Reload],
        "proxy calls",
    )?;

    println!("  ✅ Scale up applied");
    Ok(())
}

/// Test 3: endpoints of a service no site uses change nothing
async fn test_unrelated_service(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: Unrelated service");

    ctx.proxy.clear_calls();
    ctx.stores
        .endpoint_slices
        .apply(fixtures::endpoint_slice("other-svc", &["10.0.9.9"]));
    ctx.sync(TaskKind::Endpoints, "other-svc").await;

    ensure(ctx.proxy.calls().is_empty(), "Unrelated endpoints touched the proxy")?;

    println!("  ✅ Nothing applied");
    Ok(())
}

pub struct PlusEndpointScenario;

#[async_trait::async_trait(?Send)]
impl TestScenario for PlusEndpointScenario {
    fn name(&self) -> &str {
        "plus_endpoint_updates"
    }

    fn config(&self) -> ControllerConfig {
        ControllerConfig {
            nginx_plus: true,
            ..Default::default()
        }
    }

    async fn run(&self, ctx: &mut TestContext) -> TestResult {
        println!("\n🧪 Running Plus Endpoint Scenarios");

        seed(ctx);
        set_endpoints(ctx, &["10.0.0.1"]);
        ctx.sync(TaskKind::Ingress, "tea").await;
        ensure_eq(ctx.proxy.reload_count(), 1, "initial apply")?;

        test_incremental(ctx).await?;
        test_fallback_once(ctx).await?;

        println!("✅ All Plus endpoint tests passed!\n");
        Ok(())
    }
}

/// Test 1: members go through the upstream API, no file and no reload
async fn test_incremental(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: Incremental member update");

    ctx.proxy.clear_calls();
    set_endpoints(ctx, &["10.0.0.3"]);
    ctx.sync(TaskKind::Endpoints, "tea-svc").await;

    let calls = ctx.proxy.calls();
    ensure_eq(calls.len(), 1, "proxy calls")?;
    ensure(
        matches!(&calls[0], ManagerCall::UpdateUpstreamMembers(name, _) if name == UPSTREAM),
        format!("Expected an upstream update for {}, got {:?}", UPSTREAM, calls[0]),
    )?;
    ensure_eq(ctx.proxy.reload_count(), 0, "reloads")?;

    println!("  ✅ Upstream API only");
    Ok(())
}

/// Test 2: an API failure falls back to exactly one full apply
async fn test_fallback_once(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: Upstream API failure");

    ctx.proxy.clear_calls();
    ctx.proxy.fail_next_upstream_update("connection refused");
    set_endpoints(ctx, &["10.0.0.4"]);
    ctx.sync(TaskKind::Endpoints, "tea-svc").await;

    ensure_eq(ctx.proxy.reload_count(), 1, "reloads")?;
    let config = ctx.ingress_config(CONFIG_NAME)?;
    ensure_eq(
        upstream_endpoints(&config, "tea-svc-80")?,
        vec!["10.0.0.4:8080".to_string()],
        "members after fallback",
    )?;
    ensure(
        ctx.controller.configurator().has_fragment(&super::super::framework::key("tea")),
        "Site is no longer live",
    )?;

    println!("  ✅ One full apply");
    Ok(())
}
