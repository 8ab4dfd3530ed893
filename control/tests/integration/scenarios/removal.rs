//! Site Removal Test
//!
//! Deleting a site reloads the proxy only while something is left to serve.

use super::super::framework::assertions::{ensure, ensure_eq};
use super::super::framework::{fixtures, key, TestContext, TestResult};
use super::super::TestScenario;
use control::proxy::fake::ManagerCall;
use control::reconcile::reporter::StatusChange;
use control::reconcile::task_queue::TaskKind;

pub struct RemovalScenario;

#[async_trait::async_trait(?Send)]
impl TestScenario for RemovalScenario {
    fn name(&self) -> &str {
        "site_removal"
    }

    async fn run(&self, ctx: &mut TestContext) -> TestResult {
        println!("\n🧪 Running Site Removal Scenarios");

        for (name, host) in [("tea", "tea.example.com"), ("coffee", "coffee.example.com")] {
            ctx.stores
                .ingresses
                .apply(fixtures::simple_ingress(name, host, &format!("{}-svc", name)));
            ctx.sync(TaskKind::Ingress, name).await;
        }
        ensure_eq(ctx.proxy.config_names().len(), 2, "live artifacts")?;

        test_remove_with_remaining(ctx).await?;
        test_remove_last(ctx).await?;
        test_remove_unknown(ctx).await?;

        println!("✅ All removal tests passed!\n");
        Ok(())
    }
}

/// Test 1: coffee is still live, so removing tea reloads
async fn test_remove_with_remaining(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: Remove one of two sites");

    ctx.proxy.clear_calls();
    ctx.stores.ingresses.delete(&key("tea"));
    ctx.sync(TaskKind::Ingress, "tea").await;

    ensure_eq(
        ctx.proxy.calls(),
        vec![ManagerCall::DeleteConfig("default-tea".to_string()), ManagerCall::Reload],
        "proxy calls",
    )?;
    ensure_eq(
        ctx.proxy.config_names(),
        vec!["default-coffee".to_string()],
        "remaining artifacts",
    )?;

    println!("  ✅ Deleted and reloaded");
    Ok(())
}

/// Test 2: nothing left to serve, no reload
async fn test_remove_last(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: Remove the last site");

    ctx.proxy.clear_calls();
    ctx.stores.ingresses.delete(&key("coffee"));
    ctx.sync(TaskKind::Ingress, "coffee").await;

    ensure_eq(
        ctx.proxy.calls(),
        vec![ManagerCall::DeleteConfig("default-coffee".to_string())],
        "proxy calls",
    )?;
    ensure(ctx.controller.configurator().state().is_empty(), "Applied state is not empty")?;

    println!("  ✅ Deleted without reload");
    Ok(())
}

/// Test 3: deleting something that was never live touches nothing
async fn test_remove_unknown(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: Remove an unknown Ingress");

    ctx.proxy.clear_calls();
    ctx.reporter.clear();
    ctx.sync(TaskKind::Ingress, "tea").await;

    ensure(ctx.proxy.calls().is_empty(), "Unknown Ingress touched the proxy")?;
    ensure(
        !ctx
            .reporter
            .status_changes()
            .contains(&StatusChange::Updated(key("tea"))),
        "Unknown Ingress got a status",
    )?;

    println!("  ✅ No-op");
    Ok(())
}
