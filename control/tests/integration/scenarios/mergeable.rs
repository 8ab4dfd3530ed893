//! Mergeable Ingress Test
//!
//! A master and its minions share one host and become one server. The
//! oldest minion owns a contested path; the newer one is told so.

use super::super::framework::assertions::{ensure, ensure_eq, location_paths, messages, outcomes};
use super::super::framework::{fixtures, TestContext, TestResult};
use super::super::TestScenario;
use control::reconcile::configurator::IngressCounts;
use control::reconcile::reporter::{Outcome, ResourceKind};
use control::reconcile::task_queue::TaskKind;

const CONFIG_NAME: &str = "default-ok-master";

pub struct MergeableScenario;

#[async_trait::async_trait(?Send)]
impl TestScenario for MergeableScenario {
    fn name(&self) -> &str {
        "mergeable_ingress"
    }

    async fn run(&self, ctx: &mut TestContext) -> TestResult {
        println!("\n🧪 Running Mergeable Ingress Scenarios");

        test_master_with_minions(ctx).await?;
        test_path_collision(ctx).await?;
        test_master_removed(ctx).await?;

        println!("✅ All mergeable Ingress tests passed!\n");
        Ok(())
    }
}

/// Test 1: ok.com master with /coffee and /tea minions
async fn test_master_with_minions(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: Master with two minions");

    ctx.stores.ingresses.apply(fixtures::master("ok-master"));
    ctx.stores
        .ingresses
        .apply(fixtures::minion("coffee", "2024-01-01T00:00:01Z", &["/coffee"]));
    ctx.stores
        .ingresses
        .apply(fixtures::minion("tea", "2024-01-01T00:00:02Z", &["/tea"]));

    ctx.sync(TaskKind::Ingress, "ok-master").await;

    let config = ctx.ingress_config(CONFIG_NAME)?;
    ensure_eq(config.servers.len(), 1, "servers")?;
    ensure_eq(config.servers[0].name.as_str(), "ok.com", "server name")?;
    let mut paths = location_paths(&config);
    paths.sort();
    ensure_eq(paths, vec!["/coffee".to_string(), "/tea".to_string()], "locations")?;
    ensure_eq(
        ctx.controller.configurator().ingress_counts(),
        IngressCounts {
            master: 1,
            regular: 0,
            minion: 2,
        },
        "ingress counts",
    )?;
    ensure_eq(ctx.proxy.config_names().len(), 1, "one artifact for the whole host")?;
    for minion in ["coffee", "tea"] {
        ensure_eq(
            outcomes(&ctx.reporter, ResourceKind::Ingress, minion),
            vec![Outcome::AddedOrUpdated],
            minion,
        )?;
    }

    println!("  ✅ One server, two locations");
    Ok(())
}

/// Test 2: a newer minion claiming /coffee loses it
async fn test_path_collision(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: Path claimed twice");

    ctx.reporter.clear();
    ctx.stores
        .ingresses
        .apply(fixtures::minion("coffee-v2", "2024-01-01T00:00:03Z", &["/coffee"]));

    // The minion task only points at its master
    ctx.sync(TaskKind::IngressMinion, "coffee-v2").await;
    let processed = ctx.drain().await;
    ensure_eq(processed, 1, "master resyncs")?;

    let ignored: Vec<String> = outcomes(&ctx.reporter, ResourceKind::Ingress, "coffee-v2")
        .into_iter()
        .zip(messages(&ctx.reporter, ResourceKind::Ingress, "coffee-v2"))
        .filter(|(outcome, _)| *outcome == Outcome::Ignored)
        .map(|(_, message)| message)
        .collect();
    ensure_eq(ignored.len(), 1, "diagnostics for coffee-v2")?;
    ensure(
        ignored[0].contains("Path /coffee for Ingress Resource default/coffee-v2 will be ignored"),
        format!("Unexpected diagnostic: {}", ignored[0]),
    )?;

    let config = ctx.ingress_config(CONFIG_NAME)?;
    let coffee = config.servers[0]
        .locations
        .iter()
        .find(|l| l.path == "/coffee")
        .ok_or("/coffee location is gone")?;
    ensure_eq(
        coffee.minion.as_ref().map(|m| m.name.as_str()),
        Some("coffee"),
        "/coffee owner",
    )?;
    ensure_eq(location_paths(&config).len(), 2, "locations")?;

    println!("  ✅ Oldest minion keeps the path");
    Ok(())
}

/// Test 3: deleting the master takes the whole host down
async fn test_master_removed(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: Master deleted");

    ctx.stores
        .ingresses
        .delete(&super::super::framework::key("ok-master"));
    ctx.sync(TaskKind::Ingress, "ok-master").await;

    ensure(ctx.proxy.config(CONFIG_NAME).is_none(), "Composite artifact remains")?;
    ensure_eq(
        ctx.controller.configurator().ingress_counts(),
        IngressCounts::default(),
        "ingress counts",
    )?;

    println!("  ✅ Host removed");
    Ok(())
}
