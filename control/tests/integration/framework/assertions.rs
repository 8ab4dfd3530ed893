//! Assertion helpers returning errors instead of panicking, so one failing
//! scenario does not abort the rest of the run

use std::fmt::Debug;

use common::IngressConfig;
use control::reconcile::reporter::{Outcome, RecordingReporter, ResourceKind, ResourceRef};

use super::{key, TestResult};

pub fn ensure(condition: bool, message: impl Into<String>) -> TestResult {
    if condition {
        Ok(())
    } else {
        Err(message.into().into())
    }
}

pub fn ensure_eq<T: PartialEq + Debug>(actual: T, expected: T, what: &str) -> TestResult {
    if actual == expected {
        return Ok(());
    }
    Err(format!("{}: expected {:?}, got {:?}", what, expected, actual).into())
}

/// Outcomes reported for one resource, in order
pub fn outcomes(reporter: &RecordingReporter, kind: ResourceKind, name: &str) -> Vec<Outcome> {
    reporter
        .reports_for(&ResourceRef::new(kind, key(name)))
        .iter()
        .map(|report| report.outcome)
        .collect()
}

/// Messages reported for one resource, in order
pub fn messages(reporter: &RecordingReporter, kind: ResourceKind, name: &str) -> Vec<String> {
    reporter
        .reports_for(&ResourceRef::new(kind, key(name)))
        .into_iter()
        .map(|report| report.message)
        .collect()
}

/// Endpoints of the upstream whose name ends with `suffix`
pub fn upstream_endpoints(
    config: &IngressConfig,
    suffix: &str,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let upstream = config
        .upstreams
        .iter()
        .find(|u| u.name.ends_with(suffix))
        .ok_or(format!("No upstream ending with {}", suffix))?;
    Ok(upstream.servers.iter().map(|s| s.endpoint()).collect())
}

/// Paths of every location across all servers
pub fn location_paths(config: &IngressConfig) -> Vec<String> {
    config
        .servers
        .iter()
        .flat_map(|server| server.locations.iter().map(|l| l.path.clone()))
        .collect()
}
