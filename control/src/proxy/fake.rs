//! In-memory proxy manager
//!
//! Keeps written files in maps and records every call in order. Reloads and
//! upstream API calls can be scripted to fail.

use async_trait::async_trait;
use common::ServerParams;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use super::manager::{ManagerError, ProxyManager};
use crate::reconcile::cache::safe_lock;

/// One call made against the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerCall {
    WriteMainConfig,
    WriteConfig(String),
    DeleteConfig(String),
    WriteSecret(String),
    DeleteSecret(String),
    Reload,
    UpdateUpstreamMembers(String, Vec<String>),
}

#[derive(Default)]
struct FakeState {
    main_config: Vec<u8>,
    configs: BTreeMap<String, Vec<u8>>,
    secrets: BTreeMap<String, (Vec<u8>, u32)>,
    calls: Vec<ManagerCall>,
    member_params: BTreeMap<String, ServerParams>,
    version: u64,
    reload_failures: VecDeque<String>,
    api_failures: VecDeque<String>,
}

#[derive(Default)]
pub struct FakeManager {
    state: Mutex<FakeState>,
}

impl FakeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next reload fails with `message`
    pub fn fail_next_reload(&self, message: &str) {
        safe_lock(&self.state)
            .reload_failures
            .push_back(message.to_string());
    }

    /// The next upstream API call fails with `message`
    pub fn fail_next_upstream_update(&self, message: &str) {
        safe_lock(&self.state)
            .api_failures
            .push_back(message.to_string());
    }

    pub fn calls(&self) -> Vec<ManagerCall> {
        safe_lock(&self.state).calls.clone()
    }

    pub fn clear_calls(&self) {
        let mut state = safe_lock(&self.state);
        state.calls.clear();
        state.member_params.clear();
    }

    /// Member parameters of the last upstream API update of `upstream`
    pub fn member_params(&self, upstream: &str) -> Option<ServerParams> {
        safe_lock(&self.state).member_params.get(upstream).cloned()
    }

    pub fn reload_count(&self) -> usize {
        safe_lock(&self.state)
            .calls
            .iter()
            .filter(|c| **c == ManagerCall::Reload)
            .count()
    }

    pub fn config_version(&self) -> u64 {
        safe_lock(&self.state).version
    }

    pub fn config(&self, name: &str) -> Option<Vec<u8>> {
        safe_lock(&self.state).configs.get(name).cloned()
    }

    pub fn config_names(&self) -> Vec<String> {
        safe_lock(&self.state).configs.keys().cloned().collect()
    }

    pub fn main_config(&self) -> Vec<u8> {
        safe_lock(&self.state).main_config.clone()
    }

    pub fn secret(&self, name: &str) -> Option<(Vec<u8>, u32)> {
        safe_lock(&self.state).secrets.get(name).cloned()
    }
}

#[async_trait]
impl ProxyManager for FakeManager {
    async fn write_main_config(&self, content: &[u8]) -> Result<(), ManagerError> {
        let mut state = safe_lock(&self.state);
        state.main_config = content.to_vec();
        state.calls.push(ManagerCall::WriteMainConfig);
        Ok(())
    }

    async fn write_config(&self, name: &str, content: &[u8]) -> Result<(), ManagerError> {
        let mut state = safe_lock(&self.state);
        state.configs.insert(name.to_string(), content.to_vec());
        state.calls.push(ManagerCall::WriteConfig(name.to_string()));
        Ok(())
    }

    async fn delete_config(&self, name: &str) -> Result<(), ManagerError> {
        let mut state = safe_lock(&self.state);
        state.configs.remove(name);
        state.calls.push(ManagerCall::DeleteConfig(name.to_string()));
        Ok(())
    }

    async fn write_secret(&self, name: &str, content: &[u8], mode: u32) -> Result<String, ManagerError> {
        let mut state = safe_lock(&self.state);
        state
            .secrets
            .insert(name.to_string(), (content.to_vec(), mode));
        state.calls.push(ManagerCall::WriteSecret(name.to_string()));
        Ok(self.secret_path(name))
    }

    async fn delete_secret(&self, name: &str) -> Result<(), ManagerError> {
        let mut state = safe_lock(&self.state);
        state.secrets.remove(name);
        state.calls.push(ManagerCall::DeleteSecret(name.to_string()));
        Ok(())
    }

    fn secret_path(&self, name: &str) -> String {
        format!("/etc/nginx/secrets/{}", name)
    }

    async fn reload(&self) -> Result<(), ManagerError> {
        let mut state = safe_lock(&self.state);
        state.version += 1;
        state.calls.push(ManagerCall::Reload);
        match state.reload_failures.pop_front() {
            Some(message) => Err(ManagerError::Reload(message)),
            None => Ok(()),
        }
    }

    async fn update_upstream_members(
        &self,
        upstream: &str,
        members: &[String],
        params: &ServerParams,
    ) -> Result<(), ManagerError> {
        let mut state = safe_lock(&self.state);
        state.calls.push(ManagerCall::UpdateUpstreamMembers(
            upstream.to_string(),
            members.to_vec(),
        ));
        state
            .member_params
            .insert(upstream.to_string(), params.clone());
        match state.api_failures.pop_front() {
            Some(message) => Err(ManagerError::Api(message)),
            None => Ok(()),
        }
    }
}
