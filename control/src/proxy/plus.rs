//! HTTP client for the proxy's control endpoints
//!
//! Two endpoints are used: the config version endpoint, polled after every
//! reload, and the Plus upstream API used for incremental member updates.

use common::ServerParams;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use super::manager::ManagerError;

/// Plus API version the upstream endpoints are addressed with
const PLUS_API_VERSION: u32 = 5;

/// Header carrying the config version the caller expects the proxy to run
pub const EXPECTED_CONFIG_VERSION_HEADER: &str = "x-expected-config-version";

#[derive(Debug, Deserialize)]
struct PlusServer {
    id: i64,
    server: String,
}

#[derive(Debug, Serialize)]
struct NewPlusServer<'a> {
    server: &'a str,
    max_fails: i64,
    fail_timeout: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    slow_start: &'a str,
}

/// Thin wrapper over the hyper-util client
#[derive(Clone)]
pub struct ApiClient {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiClient {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, String)],
        body: Bytes,
    ) -> Result<(StatusCode, Bytes), ManagerError> {
        let mut builder = Request::builder().method(method).uri(url);
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| ManagerError::Api(format!("Failed to build request for {}: {}", url, e)))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ManagerError::Api(format!("Request to {} failed: {}", url, e)))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ManagerError::Api(format!("Failed to read response of {}: {}", url, e)))?
            .to_bytes();
        Ok((status, body))
    }

    /// Config version the proxy currently serves, if it answers
    pub async fn config_version(&self, url: &str) -> Result<u64, ManagerError> {
        let (status, body) = self.send(Method::GET, url, &[], Bytes::new()).await?;
        if status != StatusCode::OK {
            return Err(ManagerError::Api(format!(
                "{} returned non-success status: {}",
                url, status
            )));
        }
        String::from_utf8_lossy(&body)
            .trim()
            .parse()
            .map_err(|e| ManagerError::Api(format!("Invalid config version from {}: {}", url, e)))
    }

    /// Fails unless the worker behind the Plus API runs `version`
    pub async fn verify_config_version(&self, base: &str, version: u64) -> Result<(), ManagerError> {
        let url = format!("{}/configVersionCheck", base);
        let headers = [(EXPECTED_CONFIG_VERSION_HEADER, version.to_string())];
        let (status, _) = self.send(Method::GET, &url, &headers, Bytes::new()).await?;
        if status != StatusCode::OK {
            return Err(ManagerError::Api(format!(
                "error verifying config version: API returned non-success status: {}",
                status
            )));
        }
        Ok(())
    }

    /// Make the members of `upstream` equal to `servers`
    ///
    /// Returns the number of added and removed members.
    pub async fn update_http_servers(
        &self,
        base: &str,
        upstream: &str,
        servers: &[String],
        params: &ServerParams,
    ) -> Result<(usize, usize), ManagerError> {
        let url = format!(
            "{}/api/{}/http/upstreams/{}/servers",
            base, PLUS_API_VERSION, upstream
        );

        let (status, body) = self.send(Method::GET, &url, &[], Bytes::new()).await?;
        if status != StatusCode::OK {
            return Err(ManagerError::Api(format!(
                "failed to get servers of upstream {}: {}",
                upstream, status
            )));
        }
        let current: Vec<PlusServer> = serde_json::from_slice(&body)
            .map_err(|e| ManagerError::Api(format!("Invalid servers of {}: {}", upstream, e)))?;

        let wanted: BTreeSet<&str> = servers.iter().map(String::as_str).collect();
        let present: BTreeSet<&str> = current.iter().map(|s| s.server.as_str()).collect();

        let mut added = 0;
        for server in wanted.difference(&present) {
            let payload = serde_json::to_vec(&NewPlusServer {
                server,
                max_fails: params.max_fails,
                fail_timeout: &params.fail_timeout,
                slow_start: &params.slow_start,
            })
            .map_err(|e| ManagerError::Api(e.to_string()))?;
            let headers = [("content-type", "application/json".to_string())];
            let (status, _) = self
                .send(Method::POST, &url, &headers, Bytes::from(payload))
                .await?;
            if !status.is_success() {
                return Err(ManagerError::Api(format!(
                    "failed to add server {} to upstream {}: {}",
                    server, upstream, status
                )));
            }
            added += 1;
        }

        let mut removed = 0;
        for server in current.iter().filter(|s| !wanted.contains(s.server.as_str())) {
            let (status, _) = self
                .send(
                    Method::DELETE,
                    &format!("{}/{}", url, server.id),
                    &[],
                    Bytes::new(),
                )
                .await?;
            if !status.is_success() {
                return Err(ManagerError::Api(format!(
                    "failed to remove server {} from upstream {}: {}",
                    server.server, upstream, status
                )));
            }
            removed += 1;
        }

        debug!(
            upstream,
            added, removed, "Updated upstream servers through the API"
        );
        Ok((added, removed))
    }
}
