//! Configurator
//!
//! Owns the AppliedState table and the render/write/reload sequence. Only the
//! single queue worker calls into it, so nothing here is locked.
//!
//! ```text
//!  resolved / composite / vs site
//!        │
//!        ├─ write secrets ──► SecretFiles
//!        ├─ assemble ───────► IngressConfig / VirtualServerConfig
//!        ├─ render + write ─► conf.d/<name>.conf
//!        ├─ record ─────────► AppliedState
//!        └─ reload ─────────► proxy confirms the new config version
//! ```
//!
//! AppliedState is recorded as soon as the artifact is written. A failed
//! reload does not roll it back: the file on disk is what the proxy will load
//! next, so a later successful reload converges.

use common::{ingress_config_name, virtual_server_config_name, ServerParams};
use k8s_openapi::api::core::v1::Secret;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::annotations::{
    filter_master_annotations, filter_minion_annotations, merge_master_annotations_into_minion,
    parse_annotations,
};
use super::assembler::{
    generate_composite_config, generate_ingress_config, ingress_upstream_members, AssemblyContext,
    SecretFiles,
};
use super::cache::ResourceKey;
use super::fragment::ResolvedFragment;
use super::merge::CompositeSite;
use super::params::{generate_main_config, ConfigParams, StaticConfigParams};
use super::secrets::{
    jwk_content, pem_content, DEFAULT_SERVER_SECRET_NAME, JWK_SECRET_FILE_MODE,
    TLS_SECRET_FILE_MODE, WILDCARD_SECRET_NAME,
};
use super::virtualserver::VirtualServerSite;
use super::vs_assembler::{generate_virtual_server_config, virtual_server_upstream_members};
use crate::proxy::manager::{ManagerError, ProxyManager};
use crate::proxy::renderer::{RenderError, Renderer};

#[derive(Error, Debug)]
pub enum ConfiguratorError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("Error when updating the {kind} template: {source}")]
    Template {
        kind: &'static str,
        #[source]
        source: RenderError,
    },
}

// =============================================================================
// AppliedState
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    /// A simple Ingress
    Fragment,
    /// A master with its merged minions
    Composite,
    /// A VirtualServer with its merged routes
    VirtualServer,
}

/// One rendered site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedSite {
    pub config_name: String,
    pub kind: SiteKind,
    /// Minions of a composite, routes of a VirtualServer
    pub leaves: BTreeSet<ResourceKey>,
}

/// Ingress counts by role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngressCounts {
    pub master: usize,
    pub regular: usize,
    pub minion: usize,
}

/// What the proxy currently has, by resource key.
///
/// Ingresses and VirtualServers are kept apart: the same `namespace/name`
/// may exist as both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedState {
    ingresses: BTreeMap<ResourceKey, AppliedSite>,
    virtual_servers: BTreeMap<ResourceKey, AppliedSite>,
}

impl AppliedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State with the given fragments and composites already live
    pub fn seeded(
        fragments: impl IntoIterator<Item = ResourceKey>,
        composites: impl IntoIterator<Item = (ResourceKey, Vec<ResourceKey>)>,
    ) -> Self {
        let mut state = Self::new();
        for key in fragments {
            state.record_fragment(&key);
        }
        for (key, minions) in composites {
            state.record_composite(&key, minions);
        }
        state
    }

    pub fn has_fragment(&self, key: &ResourceKey) -> bool {
        self.ingresses.contains_key(key)
    }

    pub fn has_composite(&self, key: &ResourceKey, leaf: &ResourceKey) -> bool {
        self.ingresses
            .get(key)
            .is_some_and(|site| site.kind == SiteKind::Composite && site.leaves.contains(leaf))
    }

    pub fn has_virtual_server(&self, key: &ResourceKey) -> bool {
        self.virtual_servers.contains_key(key)
    }

    pub fn ingress(&self, key: &ResourceKey) -> Option<&AppliedSite> {
        self.ingresses.get(key)
    }

    pub fn virtual_server(&self, key: &ResourceKey) -> Option<&AppliedSite> {
        self.virtual_servers.get(key)
    }

    /// Live Ingresses, simple and master, in key order
    pub fn ingress_keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.ingresses.keys()
    }

    pub fn virtual_server_keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.virtual_servers.keys()
    }

    /// Number of rendered artifacts
    pub fn len(&self) -> usize {
        self.ingresses.len() + self.virtual_servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ingress_counts(&self) -> IngressCounts {
        let mut counts = IngressCounts::default();
        for site in self.ingresses.values() {
            match site.kind {
                SiteKind::Composite => {
                    counts.master += 1;
                    counts.minion += site.leaves.len();
                }
                _ => counts.regular += 1,
            }
        }
        counts
    }

    fn record_fragment(&mut self, key: &ResourceKey) {
        self.ingresses.insert(
            key.clone(),
            AppliedSite {
                config_name: ingress_config_name(&key.namespace, &key.name),
                kind: SiteKind::Fragment,
                leaves: BTreeSet::new(),
            },
        );
    }

    fn record_composite(&mut self, key: &ResourceKey, minions: impl IntoIterator<Item = ResourceKey>) {
        self.ingresses.insert(
            key.clone(),
            AppliedSite {
                config_name: ingress_config_name(&key.namespace, &key.name),
                kind: SiteKind::Composite,
                leaves: minions.into_iter().collect(),
            },
        );
    }

    fn record_virtual_server(&mut self, key: &ResourceKey, routes: impl IntoIterator<Item = ResourceKey>) {
        self.virtual_servers.insert(
            key.clone(),
            AppliedSite {
                config_name: virtual_server_config_name(&key.namespace, &key.name),
                kind: SiteKind::VirtualServer,
                leaves: routes.into_iter().collect(),
            },
        );
    }

    fn remove_ingress(&mut self, key: &ResourceKey) -> Option<AppliedSite> {
        self.ingresses.remove(key)
    }

    fn remove_virtual_server(&mut self, key: &ResourceKey) -> Option<AppliedSite> {
        self.virtual_servers.remove(key)
    }
}

// =============================================================================
// Configurator
// =============================================================================

/// Sites re-rendered together by one operation
#[derive(Debug, Clone, Default)]
pub struct SiteSet {
    pub fragments: Vec<ResolvedFragment>,
    pub composites: Vec<CompositeSite>,
    pub virtual_servers: Vec<VirtualServerSite>,
}

impl SiteSet {
    pub fn len(&self) -> usize {
        self.fragments.len() + self.composites.len() + self.virtual_servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How an endpoints change reached the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointsUpdate {
    /// Pushed through the upstream API, no reload
    Incremental,
    /// Rendered, written and reloaded
    FullApply,
}

pub struct Configurator {
    manager: Arc<dyn ProxyManager>,
    renderer: Box<dyn Renderer>,
    params: ConfigParams,
    static_params: StaticConfigParams,
    nginx_plus: bool,
    wildcard_enabled: bool,
    missing_secret_pem: String,
    state: AppliedState,
}

impl Configurator {
    pub fn new(
        manager: Arc<dyn ProxyManager>,
        renderer: Box<dyn Renderer>,
        params: ConfigParams,
        static_params: StaticConfigParams,
        nginx_plus: bool,
        wildcard_enabled: bool,
    ) -> Self {
        let missing_secret_pem = manager.secret_path(DEFAULT_SERVER_SECRET_NAME);
        Self {
            manager,
            renderer,
            params,
            static_params,
            nginx_plus,
            wildcard_enabled,
            missing_secret_pem,
            state: AppliedState::new(),
        }
    }

    /// Replace the applied state, for restoring or seeding tests
    pub fn with_state(mut self, state: AppliedState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &AppliedState {
        &self.state
    }

    pub fn params(&self) -> &ConfigParams {
        &self.params
    }

    pub fn nginx_plus(&self) -> bool {
        self.nginx_plus
    }

    pub fn is_resolver_configured(&self) -> bool {
        !self.params.resolver_addresses.is_empty()
    }

    pub fn has_fragment(&self, key: &ResourceKey) -> bool {
        self.state.has_fragment(key)
    }

    pub fn has_composite(&self, key: &ResourceKey, leaf: &ResourceKey) -> bool {
        self.state.has_composite(key, leaf)
    }

    pub fn has_virtual_server(&self, key: &ResourceKey) -> bool {
        self.state.has_virtual_server(key)
    }

    pub fn ingress_counts(&self) -> IngressCounts {
        self.state.ingress_counts()
    }

    fn ctx(&self) -> AssemblyContext<'_> {
        AssemblyContext {
            params: &self.params,
            nginx_plus: self.nginx_plus,
            resolver_configured: self.is_resolver_configured(),
            missing_secret_pem: &self.missing_secret_pem,
        }
    }

    fn server_params(&self, params: &ConfigParams) -> ServerParams {
        ServerParams {
            max_fails: params.max_fails,
            fail_timeout: params.fail_timeout.clone(),
            slow_start: params.slow_start.clone(),
        }
    }

    async fn reload(&self) -> Result<(), ConfiguratorError> {
        self.manager.reload().await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Secrets
    // -------------------------------------------------------------------------

    async fn write_tls_secret(&self, namespace: &str, secret: &Secret) -> Result<String, ConfiguratorError> {
        let name = ResourceKey::new(namespace, secret.metadata.name.clone().unwrap_or_default()).file_name();
        Ok(self
            .manager
            .write_secret(&name, &pem_content(secret), TLS_SECRET_FILE_MODE)
            .await?)
    }

    /// Write the TLS secrets of a fragment and map each host to its PEM.
    ///
    /// A TLS entry without a secret name uses the wildcard secret when one
    /// is configured. A missing or invalid secret maps to the missing PEM,
    /// so the server fails closed.
    async fn write_fragment_secrets(&self, resolved: &ResolvedFragment) -> Result<SecretFiles, ConfiguratorError> {
        let fragment = &resolved.fragment;
        let mut files = SecretFiles::default();

        for tls in &fragment.tls {
            let pem = if tls.secret_name.is_empty() && self.wildcard_enabled {
                self.manager.secret_path(WILDCARD_SECRET_NAME)
            } else {
                match resolved.tls_secrets.get(&tls.secret_name) {
                    Some(secret) => self.write_tls_secret(&fragment.key.namespace, secret).await?,
                    None => self.missing_secret_pem.clone(),
                }
            };

            if tls.hosts.is_empty() {
                files.pems.insert(String::new(), pem);
            } else {
                for host in &tls.hosts {
                    files.pems.insert(host.clone(), pem.clone());
                }
            }
        }

        files.jwt_key_file = self.write_jwk_file(resolved).await?.unwrap_or_default();
        Ok(files)
    }

    /// Path of the fragment's JWK file, writing it when the secret is valid.
    /// Nothing on OSS.
    async fn write_jwk_file(&self, resolved: &ResolvedFragment) -> Result<Option<String>, ConfiguratorError> {
        let Some(jwt_key) = resolved.jwt_key.as_ref().filter(|_| self.nginx_plus) else {
            return Ok(None);
        };
        let name = ResourceKey::new(&resolved.key().namespace, &jwt_key.name).file_name();
        match &jwt_key.secret {
            Some(secret) => Ok(Some(
                self.manager
                    .write_secret(&name, &jwk_content(secret), JWK_SECRET_FILE_MODE)
                    .await?,
            )),
            None => Ok(Some(self.manager.secret_path(&name))),
        }
    }

    // -------------------------------------------------------------------------
    // Writing sites
    // -------------------------------------------------------------------------

    async fn write_fragment(&mut self, resolved: &ResolvedFragment) -> Result<(), ConfiguratorError> {
        let files = self.write_fragment_secrets(resolved).await?;
        let key = resolved.key();
        let config = generate_ingress_config(resolved, &files, false, &self.ctx());
        let content = self.renderer.render_ingress(&config)?;
        let name = ingress_config_name(&key.namespace, &key.name);

        self.manager.write_config(&name, &content).await?;
        self.state.record_fragment(key);
        Ok(())
    }

    async fn write_composite(&mut self, site: &CompositeSite) -> Result<(), ConfiguratorError> {
        let master_files = self.write_fragment_secrets(&site.master).await?;
        let mut minion_jwt_files = HashMap::new();
        for minion in &site.minions {
            if let Some(path) = self.write_jwk_file(minion).await? {
                minion_jwt_files.insert(minion.key().clone(), path);
            }
        }

        let config = generate_composite_config(site, &master_files, &minion_jwt_files, &self.ctx());
        let content = self.renderer.render_ingress(&config)?;
        let key = site.key();
        let name = ingress_config_name(&key.namespace, &key.name);

        self.manager.write_config(&name, &content).await?;
        self.state.record_composite(key, site.minion_keys().cloned());
        Ok(())
    }

    async fn write_virtual_server(&mut self, site: &VirtualServerSite) -> Result<(), ConfiguratorError> {
        let pem = match &site.tls_secret {
            Some(secret) => Some(self.write_tls_secret(site.namespace(), secret).await?),
            None => None,
        };

        let config = generate_virtual_server_config(site, pem.as_deref(), &self.ctx());
        let content = self.renderer.render_virtual_server(&config)?;
        let key = site.key();
        let name = virtual_server_config_name(&key.namespace, &key.name);

        self.manager.write_config(&name, &content).await?;
        self.state.record_virtual_server(&key, site.route_keys());
        Ok(())
    }

    async fn write_sites(&mut self, sites: &SiteSet) -> Result<(), ConfiguratorError> {
        for resolved in &sites.fragments {
            self.write_fragment(resolved).await?;
        }
        for site in &sites.composites {
            self.write_composite(site).await?;
        }
        for site in &sites.virtual_servers {
            self.write_virtual_server(site).await?;
        }
        Ok(())
    }

    /// Render and write the main config, without reloading
    pub async fn write_main_config(&self) -> Result<(), ConfiguratorError> {
        let main = generate_main_config(&self.static_params, &self.params);
        let content = self.renderer.render_main(&main)?;
        self.manager.write_main_config(&content).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Ingress operations
    // -------------------------------------------------------------------------

    pub async fn apply_fragment(&mut self, resolved: &ResolvedFragment) -> Result<(), ConfiguratorError> {
        self.write_fragment(resolved).await?;
        self.reload().await
    }

    pub async fn apply_composite(&mut self, site: &CompositeSite) -> Result<(), ConfiguratorError> {
        self.write_composite(site).await?;
        self.reload().await
    }

    /// Delete the artifact of an Ingress. Reloads only when the Ingress was
    /// live and other artifacts remain.
    pub async fn remove_fragment(&mut self, key: &ResourceKey) -> Result<(), ConfiguratorError> {
        let was_live = self.state.remove_ingress(key).is_some();
        self.manager
            .delete_config(&ingress_config_name(&key.namespace, &key.name))
            .await?;

        if was_live && !self.state.is_empty() {
            self.reload().await?;
        } else {
            debug!(key = %key, live = was_live, "Skipping reload after removal");
        }
        Ok(())
    }

    /// Masters share the Ingress artifact naming, so this is the same removal
    pub async fn remove_composite(&mut self, key: &ResourceKey) -> Result<(), ConfiguratorError> {
        self.remove_fragment(key).await
    }

    /// Push new members through the upstream API, stopping at the first error
    async fn push_members(
        &self,
        members: BTreeMap<String, Vec<String>>,
        params: &ServerParams,
    ) -> Result<(), ManagerError> {
        for (upstream, servers) in members {
            self.manager
                .update_upstream_members(&upstream, &servers, params)
                .await?;
        }
        Ok(())
    }

    /// Push the members of one fragment, with member parameters taken from
    /// `annotations` (the fragment's own, or the merged set for a composite)
    async fn push_fragment_members(
        &self,
        resolved: &ResolvedFragment,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), ManagerError> {
        let params = parse_annotations(annotations, &resolved.fragment.key, &self.params, self.nginx_plus);
        self.push_members(ingress_upstream_members(resolved), &self.server_params(&params))
            .await
    }

    /// Same annotation handling as the composite render: the root is
    /// filtered, each leaf inherits from the root and is then filtered
    async fn push_composite_members(&self, site: &CompositeSite) -> Result<(), ManagerError> {
        let master = &site.master.fragment.annotations;
        let mut annotations = master.clone();
        filter_master_annotations(&mut annotations);
        self.push_fragment_members(&site.master, &annotations).await?;

        for minion in &site.minions {
            let mut annotations = minion.fragment.annotations.clone();
            merge_master_annotations_into_minion(&mut annotations, master);
            filter_minion_annotations(&mut annotations);
            self.push_fragment_members(minion, &annotations).await?;
        }
        Ok(())
    }

    /// Apply an endpoints change to a live fragment.
    ///
    /// On Plus the members go through the upstream API first. Any API error
    /// falls back to one full apply of the fragment.
    pub async fn update_endpoints_only(
        &mut self,
        resolved: &ResolvedFragment,
    ) -> Result<EndpointsUpdate, ConfiguratorError> {
        if self.nginx_plus {
            match self
                .push_fragment_members(resolved, &resolved.fragment.annotations)
                .await
            {
                Ok(()) => return Ok(EndpointsUpdate::Incremental),
                Err(e) => warn!(
                    key = %resolved.key(),
                    "Incremental update failed, applying the full config: {}", e
                ),
            }
        }
        self.apply_fragment(resolved).await?;
        Ok(EndpointsUpdate::FullApply)
    }

    /// Endpoints change of a live composite. Master and minions each push
    /// their own upstreams, minions with the parameters they inherit.
    pub async fn update_composite_endpoints(
        &mut self,
        site: &CompositeSite,
    ) -> Result<EndpointsUpdate, ConfiguratorError> {
        if self.nginx_plus {
            match self.push_composite_members(site).await {
                Ok(()) => return Ok(EndpointsUpdate::Incremental),
                Err(e) => warn!(
                    key = %site.key(),
                    "Incremental update failed, applying the full config: {}", e
                ),
            }
        }
        self.apply_composite(site).await?;
        Ok(EndpointsUpdate::FullApply)
    }

    // -------------------------------------------------------------------------
    // VirtualServer operations
    // -------------------------------------------------------------------------

    pub async fn apply_virtual_server(&mut self, site: &VirtualServerSite) -> Result<(), ConfiguratorError> {
        self.write_virtual_server(site).await?;
        self.reload().await
    }

    pub async fn remove_virtual_server(&mut self, key: &ResourceKey) -> Result<(), ConfiguratorError> {
        let was_live = self.state.remove_virtual_server(key).is_some();
        self.manager
            .delete_config(&virtual_server_config_name(&key.namespace, &key.name))
            .await?;

        if was_live && !self.state.is_empty() {
            self.reload().await?;
        }
        Ok(())
    }

    pub async fn update_virtual_server_endpoints(
        &mut self,
        site: &VirtualServerSite,
    ) -> Result<EndpointsUpdate, ConfiguratorError> {
        if self.nginx_plus {
            let params = self.server_params(&self.params);
            match self
                .push_members(virtual_server_upstream_members(site), &params)
                .await
            {
                Ok(()) => return Ok(EndpointsUpdate::Incremental),
                Err(e) => warn!(
                    key = %site.key(),
                    "Incremental update failed, applying the full config: {}", e
                ),
            }
        }
        self.apply_virtual_server(site).await?;
        Ok(EndpointsUpdate::FullApply)
    }

    // -------------------------------------------------------------------------
    // Secret operations
    // -------------------------------------------------------------------------

    /// Write a shared TLS secret (default or wildcard) under each name
    pub async fn write_special_secret(&self, secret: &Secret, names: &[&str]) -> Result<(), ConfiguratorError> {
        let content = pem_content(secret);
        for name in names {
            self.manager
                .write_secret(name, &content, TLS_SECRET_FILE_MODE)
                .await?;
        }
        Ok(())
    }

    pub async fn apply_special_secret(&self, secret: &Secret, names: &[&str]) -> Result<(), ConfiguratorError> {
        self.write_special_secret(secret, names).await?;
        self.reload().await
    }

    /// Write a TLS secret and re-apply the sites using it with one reload
    pub async fn apply_tls_secret(&mut self, secret: &Secret, sites: &SiteSet) -> Result<(), ConfiguratorError> {
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        self.write_tls_secret(&namespace, secret).await?;
        self.write_sites(sites).await?;
        self.reload().await
    }

    /// Write a JWK secret. The proxy reads the key per request, so no reload.
    pub async fn apply_jwk_secret(&self, secret: &Secret) -> Result<String, ConfiguratorError> {
        let key = ResourceKey::from_meta(&secret.metadata);
        Ok(self
            .manager
            .write_secret(&key.file_name(), &jwk_content(secret), JWK_SECRET_FILE_MODE)
            .await?)
    }

    /// Delete a secret file and re-apply the sites that used it. Reloads
    /// only when there were sites to re-apply.
    pub async fn remove_secret(&mut self, key: &ResourceKey, sites: &SiteSet) -> Result<(), ConfiguratorError> {
        self.manager.delete_secret(&key.file_name()).await?;
        if sites.is_empty() {
            return Ok(());
        }
        self.write_sites(sites).await?;
        self.reload().await
    }

    // -------------------------------------------------------------------------
    // Global config
    // -------------------------------------------------------------------------

    /// Swap the global params, re-render the main config and every given
    /// site, then reload once
    pub async fn update_config(&mut self, params: ConfigParams, sites: &SiteSet) -> Result<(), ConfiguratorError> {
        self.renderer
            .update_main_template(params.main_template.as_deref())
            .map_err(|source| ConfiguratorError::Template { kind: "main", source })?;
        self.renderer
            .update_ingress_template(params.ingress_template.as_deref())
            .map_err(|source| ConfiguratorError::Template {
                kind: "ingress",
                source,
            })?;
        self.params = params;

        self.write_main_config().await?;
        self.write_sites(sites).await?;
        info!(sites = sites.len(), "Applied new global configuration");
        self.reload().await
    }
}
