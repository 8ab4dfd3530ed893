//! TLS Secret Lifecycle Test
//!
//! A secret used by a live site: updated, made invalid, then deleted. Each
//! step rewrites the sites that use it with one reload, and a site whose
//! secret is gone fails closed instead of disappearing.

use super::super::framework::assertions::{ensure, ensure_eq, outcomes};
use super::super::framework::{fixtures, key, TestContext, TestResult};
use super::super::TestScenario;
use control::proxy::fake::ManagerCall;
use control::reconcile::reporter::{Outcome, ResourceKind};
use control::reconcile::secrets::TLS_CERT_KEY;
use control::reconcile::task_queue::TaskKind;

const CONFIG_NAME: &str = "default-cafe-ingress";
const SECRET_FILE: &str = "default-cafe-secret";

pub struct SecretLifecycleScenario;

#[async_trait::async_trait(?Send)]
impl TestScenario for SecretLifecycleScenario {
    fn name(&self) -> &str {
        "secret_lifecycle"
    }

    async fn run(&self, ctx: &mut TestContext) -> TestResult {
        println!("\n🧪 Running TLS Secret Scenarios");

        ctx.stores.secrets.apply(fixtures::tls_secret("cafe-secret"));
        ctx.stores.ingresses.apply(fixtures::cafe_ingress(true));
        ctx.sync(TaskKind::Ingress, "cafe-ingress").await;
        ensure(ctx.proxy.secret(SECRET_FILE).is_some(), "Secret file was not written")?;

        test_update(ctx).await?;
        test_invalid(ctx).await?;
        test_removed(ctx).await?;

        println!("✅ All TLS secret tests passed!\n");
        Ok(())
    }
}

fn fails_closed(ctx: &TestContext) -> Result<bool, Box<dyn std::error::Error>> {
    let config = ctx.ingress_config(CONFIG_NAME)?;
    let ssl = config.servers[0]
        .ssl
        .as_ref()
        .ok_or("Server lost its TLS binding")?;
    Ok(ssl.fails_closed())
}

/// Test 1: a rotated certificate is one reload
async fn test_update(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: Secret updated");

    ctx.proxy.clear_calls();
    ctx.reporter.clear();
    ctx.stores.secrets.apply(fixtures::tls_secret("cafe-secret"));
    ctx.sync(TaskKind::Secret, "cafe-secret").await;

    ensure_eq(ctx.proxy.reload_count(), 1, "reloads")?;
    ensure(!fails_closed(ctx)?, "Valid secret must be served")?;
    ensure_eq(
        outcomes(&ctx.reporter, ResourceKind::Ingress, "cafe-ingress"),
        vec![Outcome::Updated],
        "Ingress outcomes",
    )?;

    println!("  ✅ One reload");
    Ok(())
}

/// Test 2: a certificate without its key is rejected and treated as gone
async fn test_invalid(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: Secret becomes invalid");

    ctx.reporter.clear();
    ctx.stores
        .secrets
        .apply(fixtures::secret("cafe-secret", &[(TLS_CERT_KEY, fixtures::CERT_PEM)]));
    ctx.sync(TaskKind::Secret, "cafe-secret").await;

    ensure_eq(
        outcomes(&ctx.reporter, ResourceKind::Secret, "cafe-secret"),
        vec![Outcome::Rejected],
        "Secret outcomes",
    )?;
    ensure(
        outcomes(&ctx.reporter, ResourceKind::Ingress, "cafe-ingress").contains(&Outcome::MissingSecret),
        "Ingress was not told about the missing secret",
    )?;
    ensure(fails_closed(ctx)?, "Invalid secret must fail closed")?;
    ensure(ctx.proxy.secret(SECRET_FILE).is_none(), "Invalid secret file remains")?;

    println!("  ✅ Rejected, site fails closed");
    Ok(())
}

/// Test 3: the secret is deleted; the site stays live without it
async fn test_removed(ctx: &mut TestContext) -> TestResult {
    println!("  📝 Test: Secret deleted");

    ctx.stores.secrets.apply(fixtures::tls_secret("cafe-secret"));
    ctx.sync(TaskKind::Secret, "cafe-secret").await;
    ensure(!fails_closed(ctx)?, "Restored secret must be served")?;

    ctx.proxy.clear_calls();
    ctx.stores.secrets.delete(&key("cafe-secret"));
    ctx.sync(TaskKind::Secret, "cafe-secret").await;

    ensure_eq(
        ctx.proxy.calls(),
        vec![
            ManagerCall::DeleteSecret(SECRET_FILE.to_string()),
            ManagerCall::WriteConfig(CONFIG_NAME.to_string()),
            ManagerCall::Reload,
        ],
        "proxy calls",
    )?;
    ensure(fails_closed(ctx)?, "Site without its secret must fail closed")?;
    ensure(
        ctx.controller.configurator().has_fragment(&key("cafe-ingress")),
        "Site was removed",
    )?;

    println!("  ✅ Site fails closed");
    Ok(())
}
