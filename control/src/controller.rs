//! Task dispatcher
//!
//! The `Controller` is the single consumer of the task queue. It owns the
//! Configurator, so every resolve/merge/apply runs on one task at a time.
//! A task only carries a key: each sync re-reads the cache, which makes
//! reconciliation level-triggered and keeps stale or reordered tasks harmless.
//!
//! Transient errors (cache unavailable) are returned from the per-kind syncs
//! and requeued by `sync`. Everything else is reported against the resource
//! and never fails the task.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::apis::metrics::{record_sync, set_ingress_counts};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconcile::annotations::has_ingress_class;
use crate::reconcile::cache::{CacheError, ResourceKey, Stores};
use crate::reconcile::configurator::{Configurator, ConfiguratorError, SiteKind, SiteSet};
use crate::reconcile::fragment::{FragmentRole, RouteFragment};
use crate::reconcile::merge::{build_composite, find_root, CompositeSite, MergeDiagnostic, MergeError};
use crate::reconcile::params::ConfigParams;
use crate::reconcile::reporter::{Outcome, Reporter, ResourceKind, ResourceRef};
use crate::reconcile::resolver::Resolver;
use crate::reconcile::secrets::{
    validate_secret, validate_tls_secret, SecretKind, DEFAULT_SERVER_SECRET_NAME,
    WILDCARD_SECRET_NAME,
};
use crate::reconcile::task_queue::{SyncHandler, Task, TaskKind, TaskQueue};
use crate::reconcile::virtualserver::{
    build_virtual_server_site, find_virtual_servers_for_route, VirtualServerSite,
};

const EXTERNAL_NAME_TYPE: &str = "ExternalName";

/// Addresses of the external Service reported in Ingress status.
///
/// An ExternalName Service reports its external name. Otherwise every load
/// balancer ingress (IP, or hostname when there is no IP) followed by the
/// external IPs.
pub fn external_addresses(svc: &Service) -> Vec<String> {
    let Some(spec) = svc.spec.as_ref() else {
        return Vec::new();
    };
    if spec.type_.as_deref() == Some(EXTERNAL_NAME_TYPE) {
        return spec.external_name.iter().cloned().collect();
    }

    let mut addresses: Vec<String> = svc
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|ingress| {
            ingress
                .ip
                .clone()
                .filter(|ip| !ip.is_empty())
                .or_else(|| ingress.hostname.clone())
                .filter(|address| !address.is_empty())
        })
        .collect();
    addresses.extend(spec.external_ips.iter().flatten().cloned());
    addresses
}

/// An Ingress to report on, with the master it is merged into
#[derive(Debug, Clone, PartialEq, Eq)]
struct IngressTarget {
    key: ResourceKey,
    master: Option<ResourceKey>,
}

/// Live sites selected for re-rendering and the resources to report on
#[derive(Debug, Default)]
struct AffectedSites {
    sites: SiteSet,
    ingresses: Vec<IngressTarget>,
    virtual_servers: Vec<ResourceKey>,
}

impl AffectedSites {
    fn is_empty(&self) -> bool {
        self.ingresses.is_empty() && self.virtual_servers.is_empty()
    }
}

/// `(outcome, message suffix)` for an add-or-update
fn added_or_updated(result: &Result<(), ConfiguratorError>) -> (Outcome, String) {
    match result {
        Ok(()) => (Outcome::AddedOrUpdated, String::new()),
        Err(e) => (
            Outcome::AddedOrUpdatedWithError,
            format!(", but not applied: {}", e),
        ),
    }
}

pub struct Controller {
    stores: Stores,
    queue: Arc<TaskQueue>,
    configurator: Configurator,
    reporter: Arc<dyn Reporter>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(
        stores: Stores,
        queue: Arc<TaskQueue>,
        configurator: Configurator,
        reporter: Arc<dyn Reporter>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            stores,
            queue,
            configurator,
            reporter,
            config,
        }
    }

    pub fn configurator(&self) -> &Configurator {
        &self.configurator
    }

    async fn dispatch(&mut self, task: &Task) -> Result<(), ControllerError> {
        match task.kind {
            // The role is re-read from the cache, it may have changed since enqueue
            TaskKind::Ingress | TaskKind::IngressMinion => self.sync_ingress(&task.key).await,
            TaskKind::Endpoints => self.sync_endpoints(&task.key).await,
            TaskKind::ConfigMap => self.sync_config_map(&task.key).await,
            TaskKind::Secret => self.sync_secret(&task.key).await,
            TaskKind::ExternalService => self.sync_external_service(&task.key).await,
            TaskKind::VirtualServer => self.sync_virtual_server(&task.key).await,
            TaskKind::VirtualServerRoute => self.sync_virtual_server_route(&task.key).await,
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.stores, self.config.nginx_plus)
    }

    fn is_managed(&self, ing: &Ingress) -> bool {
        has_ingress_class(
            ing,
            &self.config.ingress_class,
            self.config.use_ingress_class_only,
        )
    }

    /// Fragments of every Ingress this controller handles, ordered by key
    fn managed_fragments(&self) -> Result<Vec<RouteFragment>, CacheError> {
        let mut fragments: Vec<RouteFragment> = self
            .stores
            .ingresses
            .list()?
            .iter()
            .filter(|ing| self.is_managed(ing))
            .map(|ing| RouteFragment::from_ingress(ing))
            .collect();
        fragments.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(fragments)
    }

    fn build_composite_site(
        &self,
        root: RouteFragment,
        fragments: &[RouteFragment],
    ) -> Result<CompositeSite, MergeError> {
        let resolver = self.resolver();
        build_composite(root, fragments.iter().cloned(), |f| resolver.resolve(f))
    }

    /// Live masters whose composite currently contains `leaf`
    fn masters_of(&self, leaf: &ResourceKey) -> Vec<ResourceKey> {
        let state = self.configurator.state();
        state
            .ingress_keys()
            .filter(|key| state.has_composite(key, leaf))
            .cloned()
            .collect()
    }

    fn enqueue_masters_of(&self, leaf: &ResourceKey) {
        for master in self.masters_of(leaf) {
            debug!(key = %leaf, master = %master, "Re-syncing master");
            self.queue.add(Task::new(TaskKind::Ingress, master));
        }
    }

    /// Every live Ingress key, minions included
    fn live_ingress_keys(&self) -> BTreeSet<ResourceKey> {
        let state = self.configurator.state();
        let mut keys = BTreeSet::new();
        for key in state.ingress_keys() {
            keys.insert(key.clone());
            if let Some(site) = state.ingress(key) {
                keys.extend(site.leaves.iter().cloned());
            }
        }
        keys
    }

    /// Rebuild the live sites matched by the filters.
    ///
    /// A composite is affected when its master or one of its merged minions
    /// matches. Sites that no longer build are skipped: their own sync reports
    /// why.
    fn affected_sites(
        &self,
        fragment_filter: impl Fn(&RouteFragment) -> bool,
        vs_filter: impl Fn(&VirtualServerSite) -> bool,
    ) -> Result<AffectedSites, ControllerError> {
        let state = self.configurator.state();
        let resolver = self.resolver();
        let fragments = self.managed_fragments()?;
        let mut affected = AffectedSites::default();

        for fragment in &fragments {
            let Some(site) = state.ingress(&fragment.key) else {
                continue;
            };
            match (fragment.role, site.kind) {
                (FragmentRole::Simple, SiteKind::Fragment) if fragment_filter(fragment) => {
                    match resolver.resolve(fragment.clone()) {
                        Ok(resolved) => {
                            affected.ingresses.push(IngressTarget {
                                key: fragment.key.clone(),
                                master: None,
                            });
                            affected.sites.fragments.push(resolved);
                        }
                        Err(e) if e.is_transient() => return Err(e.into()),
                        Err(e) => warn!(key = %fragment.key, "Ignoring Ingress: {}", e),
                    }
                }
                (FragmentRole::CompositeRoot, SiteKind::Composite) => {
                    let root_matches = fragment_filter(fragment);
                    let leaves: Vec<&RouteFragment> = fragments
                        .iter()
                        .filter(|f| site.leaves.contains(&f.key) && fragment_filter(f))
                        .collect();
                    if !root_matches && leaves.is_empty() {
                        continue;
                    }
                    match self.build_composite_site(fragment.clone(), &fragments) {
                        Ok(composite) => {
                            if root_matches {
                                affected.ingresses.push(IngressTarget {
                                    key: fragment.key.clone(),
                                    master: None,
                                });
                            }
                            for leaf in leaves {
                                affected.ingresses.push(IngressTarget {
                                    key: leaf.key.clone(),
                                    master: Some(fragment.key.clone()),
                                });
                            }
                            affected.sites.composites.push(composite);
                        }
                        Err(e) if e.is_transient() => return Err(e.into()),
                        Err(e) => warn!(key = %fragment.key, "Ignoring Ingress (master): {}", e),
                    }
                }
                _ => {}
            }
        }

        let mut virtual_servers = self.stores.virtual_servers.list()?;
        virtual_servers.sort_by_key(|vs| ResourceKey::of(vs.as_ref()));
        for vs in virtual_servers {
            let key = ResourceKey::of(vs.as_ref());
            if !state.has_virtual_server(&key) {
                continue;
            }
            match build_virtual_server_site(vs, &self.stores, &resolver) {
                Ok(site) if vs_filter(&site) => {
                    affected.virtual_servers.push(key);
                    affected.sites.virtual_servers.push(site);
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => warn!(key = %key, "Ignoring VirtualServer: {}", e),
            }
        }

        Ok(affected)
    }

    async fn report_ingress(&self, target: &IngressTarget, outcome: Outcome, message: &str) {
        self.reporter
            .report(&ResourceRef::ingress(&target.key), outcome, message)
            .await;
        if let Some(master) = &target.master {
            let message = format!("{} for Minion {}", message, target.key);
            self.reporter
                .report(&ResourceRef::ingress(master), outcome, &message)
                .await;
        }
    }

    async fn report_affected(&self, affected: &AffectedSites, outcome: Outcome, message: &str) {
        for target in &affected.ingresses {
            self.report_ingress(target, outcome, message).await;
        }
        for key in &affected.virtual_servers {
            self.reporter
                .report(
                    &ResourceRef::new(ResourceKind::VirtualServer, key.clone()),
                    outcome,
                    message,
                )
                .await;
        }
    }

    async fn report_diagnostics(&self, diagnostics: &[MergeDiagnostic]) {
        for diagnostic in diagnostics {
            self.reporter
                .report(
                    &ResourceRef::ingress(&diagnostic.key),
                    Outcome::Ignored,
                    &diagnostic.message,
                )
                .await;
        }
    }

    /// Delete the artifact of an Ingress if it is live
    async fn remove_ingress(&mut self, key: &ResourceKey) {
        if !self.configurator.has_fragment(key) {
            return;
        }
        if let Err(e) = self.configurator.remove_fragment(key).await {
            error!(key = %key, "Error when deleting configuration: {}", e);
        }
    }

    // =========================================================================
    // Ingress
    // =========================================================================

    async fn sync_ingress(&mut self, key: &ResourceKey) -> Result<(), ControllerError> {
        let ing = self
            .stores
            .ingresses
            .get_by_key(key)?
            .filter(|ing| self.is_managed(ing));

        let Some(ing) = ing else {
            debug!(key = %key, "Deleting Ingress");
            self.remove_ingress(key).await;
            self.enqueue_masters_of(key);
            return Ok(());
        };

        let fragment = RouteFragment::from_ingress(&ing);
        debug!(key = %key, role = ?fragment.role, "Adding or updating Ingress");
        if fragment.role != FragmentRole::CompositeLeaf {
            // Was a minion before
            self.enqueue_masters_of(key);
        }

        match fragment.role {
            FragmentRole::CompositeRoot => self.sync_master(fragment).await,
            FragmentRole::CompositeLeaf => self.sync_minion(fragment).await,
            FragmentRole::Simple => self.sync_simple(fragment).await,
        }
    }

    async fn sync_simple(&mut self, fragment: RouteFragment) -> Result<(), ControllerError> {
        let key = fragment.key.clone();
        let ingress = ResourceRef::ingress(&key);

        let resolved = self.resolver().resolve(fragment);
        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                self.reporter
                    .report(&ingress, Outcome::Rejected, &format!("{} was rejected: {}", key, e))
                    .await;
                self.reporter.clear_ingress_status(&key).await;
                self.remove_ingress(&key).await;
                return Ok(());
            }
        };

        let result = self.configurator.apply_fragment(&resolved).await;
        if let Err(e) = &result {
            error!(key = %key, "Error adding or updating Ingress: {}", e);
        }
        let (outcome, suffix) = added_or_updated(&result);
        self.reporter
            .report(
                &ingress,
                outcome,
                &format!("Configuration for {} was added or updated{}", key, suffix),
            )
            .await;
        self.reporter.update_ingress_status(&key).await;
        Ok(())
    }

    async fn sync_master(&mut self, fragment: RouteFragment) -> Result<(), ControllerError> {
        let key = fragment.key.clone();
        let fragments = self.managed_fragments()?;

        let site = self.build_composite_site(fragment, &fragments);
        let site = match site {
            Ok(site) => site,
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                // A minion may fix the site without the master changing
                self.queue.requeue_after(
                    Task::new(TaskKind::Ingress, key.clone()),
                    &e,
                    self.config.requeue_delay(),
                );
                self.reporter
                    .report(
                        &ResourceRef::ingress(&key),
                        Outcome::Rejected,
                        &format!("{} was rejected: {}", key, e),
                    )
                    .await;
                self.reporter.clear_ingress_status(&key).await;
                self.remove_ingress(&key).await;
                return Ok(());
            }
        };

        self.report_diagnostics(&site.diagnostics).await;

        let result = self.configurator.apply_composite(&site).await;
        if let Err(e) = &result {
            error!(key = %key, "Error adding or updating Ingress (master): {}", e);
        }
        let (outcome, suffix) = added_or_updated(&result);

        let keys: Vec<ResourceKey> = std::iter::once(site.key())
            .chain(site.minion_keys())
            .cloned()
            .collect();
        for key in &keys {
            self.reporter
                .report(
                    &ResourceRef::ingress(key),
                    outcome,
                    &format!("Configuration for {} was added or updated{}", key, suffix),
                )
                .await;
        }
        for key in &keys {
            self.reporter.update_ingress_status(key).await;
        }
        Ok(())
    }

    /// A minion is applied through its master: find the live master and
    /// re-sync it.
    async fn sync_minion(&mut self, fragment: RouteFragment) -> Result<(), ControllerError> {
        let key = fragment.key.clone();
        // Previously live as a simple Ingress or a master
        self.remove_ingress(&key).await;

        let fragments = self.managed_fragments()?;
        let task = Task::new(TaskKind::IngressMinion, key.clone());
        let delay = self.config.requeue_delay();

        let master = find_root(&fragment, &fragments, |k| self.configurator.has_fragment(k))
            .map(|root| root.key.clone());
        let Some(master) = master else {
            self.queue.requeue_after(
                task,
                &format!("Could not find a master for the minion {}", key),
                delay,
            );
            return Ok(());
        };

        let resolved = self.resolver().resolve(fragment);
        if let Err(e) = resolved {
            if e.is_transient() {
                return Err(e.into());
            }
            self.queue.requeue_after(task, &e, delay);
            if !self.configurator.has_composite(&master, &key) {
                return Ok(());
            }
        }

        self.queue.add(Task::new(TaskKind::Ingress, master));
        Ok(())
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// `key` is the Service the changed EndpointSlices belong to
    async fn sync_endpoints(&mut self, key: &ResourceKey) -> Result<(), ControllerError> {
        let affected = self.affected_sites(
            |f| f.key.namespace == key.namespace && f.references_service(&key.name),
            |site| site.references_service(&key.namespace, &key.name),
        )?;
        if affected.is_empty() {
            debug!(key = %key, "No live site uses the service");
            return Ok(());
        }

        for resolved in &affected.sites.fragments {
            if let Err(e) = self.configurator.update_endpoints_only(resolved).await {
                error!(key = %resolved.key(), "Error updating endpoints: {}", e);
            }
        }
        for site in &affected.sites.composites {
            if let Err(e) = self.configurator.update_composite_endpoints(site).await {
                error!(key = %site.key(), "Error updating endpoints: {}", e);
            }
        }
        for site in &affected.sites.virtual_servers {
            if let Err(e) = self.configurator.update_virtual_server_endpoints(site).await {
                error!(key = %site.key(), "Error updating endpoints: {}", e);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Secrets
    // =========================================================================

    /// Names the secret is written under when it is the default or wildcard
    /// secret
    fn special_secret_names(&self, key: &ResourceKey) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.config.default_server_secret_key().as_ref() == Some(key) {
            names.push(DEFAULT_SERVER_SECRET_NAME);
        }
        if self.config.wildcard_tls_secret_key().as_ref() == Some(key) {
            names.push(WILDCARD_SECRET_NAME);
        }
        names
    }

    async fn sync_secret(&mut self, key: &ResourceKey) -> Result<(), ControllerError> {
        let secret = self.stores.secrets.get_by_key(key)?;
        let nginx_plus = self.config.nginx_plus;
        let affected = self.affected_sites(
            |f| f.key.namespace == key.namespace && f.references_secret(&key.name, nginx_plus),
            |site| site.references_secret(&key.namespace, &key.name),
        )?;
        debug!(
            key = %key,
            ingresses = affected.ingresses.len(),
            virtual_servers = affected.virtual_servers.len(),
            "Found sites using the secret"
        );
        let special = self.special_secret_names(key);

        let Some(secret) = secret else {
            self.handle_secret_removal(key, &affected).await;
            if !special.is_empty() {
                warn!("A special TLS Secret {} was removed. Retaining the Secret.", key);
            }
            return Ok(());
        };

        if !special.is_empty() {
            self.handle_special_secret_update(key, &secret, &special).await;
        }
        // A special secret may also be referenced by sites
        if !affected.is_empty() {
            self.handle_secret_update(key, &secret, &affected).await;
        }
        Ok(())
    }

    async fn handle_secret_removal(&mut self, key: &ResourceKey, affected: &AffectedSites) {
        self.report_affected(affected, Outcome::MissingSecret, &format!("Secret {} was removed", key))
            .await;

        let (outcome, message) = match self.configurator.remove_secret(key, &affected.sites).await {
            Ok(()) => (
                Outcome::Updated,
                format!("Configuration was updated due to removed secret {}", key),
            ),
            Err(e) => {
                error!(key = %key, "Error when deleting Secret: {}", e);
                (
                    Outcome::UpdatedWithError,
                    format!(
                        "Configuration was updated due to removed secret {}, but not applied: {}",
                        key, e
                    ),
                )
            }
        };
        self.report_affected(affected, outcome, &message).await;
    }

    async fn handle_special_secret_update(&mut self, key: &ResourceKey, secret: &Secret, names: &[&str]) {
        let resource = ResourceRef::new(ResourceKind::Secret, key.clone());

        if let Err(e) = validate_tls_secret(secret) {
            error!(key = %key, "Couldn't validate the special Secret: {}", e);
            self.reporter
                .report(
                    &resource,
                    Outcome::Rejected,
                    &format!(
                        "the special Secret {} was rejected, using the previous version: {}",
                        key, e
                    ),
                )
                .await;
            return;
        }

        match self.configurator.apply_special_secret(secret, names).await {
            Ok(()) => {
                self.reporter
                    .report(
                        &resource,
                        Outcome::Updated,
                        &format!("the special Secret {} was updated", key),
                    )
                    .await
            }
            Err(e) => {
                error!(key = %key, "Error when updating the special Secret: {}", e);
                self.reporter
                    .report(
                        &resource,
                        Outcome::UpdatedWithError,
                        &format!("the special Secret {} was updated, but not applied: {}", key, e),
                    )
                    .await
            }
        }
    }

    async fn handle_secret_update(&mut self, key: &ResourceKey, secret: &Secret, affected: &AffectedSites) {
        let resource = ResourceRef::new(ResourceKind::Secret, key.clone());

        let kind = match validate_secret(secret, self.config.nginx_plus) {
            Ok(kind) => kind,
            Err(e) => {
                error!(key = %key, "Removing invalid secret: {}", e);
                self.handle_secret_removal(key, affected).await;
                self.reporter
                    .report(&resource, Outcome::Rejected, &format!("{} was rejected: {}", key, e))
                    .await;
                return;
            }
        };

        let mut outcome = Outcome::Updated;
        let mut message = format!("Configuration was updated due to updated secret {}", key);

        match kind {
            SecretKind::Jwk => {
                if let Err(e) = self.configurator.apply_jwk_secret(secret).await {
                    error!(key = %key, "Error when writing the JWK Secret: {}", e);
                }
            }
            SecretKind::Tls => {
                if let Err(e) = self.configurator.apply_tls_secret(secret, &affected.sites).await {
                    error!(key = %key, "Error when updating Secret: {}", e);
                    self.reporter
                        .report(
                            &resource,
                            Outcome::UpdatedWithError,
                            &format!("{} was updated, but not applied: {}", key, e),
                        )
                        .await;
                    outcome = Outcome::UpdatedWithError;
                    message = format!("{}, but not applied: {}", message, e);
                }
            }
        }

        self.report_affected(affected, outcome, &message).await;
    }

    // =========================================================================
    // ConfigMap
    // =========================================================================

    async fn sync_config_map(&mut self, key: &ResourceKey) -> Result<(), ControllerError> {
        if self.config.config_map_key().as_ref() != Some(key) {
            debug!(key = %key, "Ignoring ConfigMap");
            return Ok(());
        }

        let config_map = self.stores.config_maps.get_by_key(key)?;
        let params = match &config_map {
            Some(cm) => ConfigParams::from_config_map(cm, self.config.nginx_plus),
            None => ConfigParams::default(),
        };
        let affected = self.affected_sites(|_| true, |_| true)?;

        let result = self.configurator.update_config(params, &affected.sites).await;
        let (outcome, suffix) = match &result {
            Ok(()) => (Outcome::Updated, String::new()),
            Err(e) => {
                error!(key = %key, "Error when updating config from ConfigMap: {}", e);
                (
                    Outcome::UpdatedWithError,
                    format!(", but was not applied: {}", e),
                )
            }
        };

        if config_map.is_some() {
            self.reporter
                .report(
                    &ResourceRef::new(ResourceKind::ConfigMap, key.clone()),
                    outcome,
                    &format!("Configuration from {} was updated{}", key, suffix),
                )
                .await;
        }
        for target in &affected.ingresses {
            let message = format!("Configuration for {} was updated{}", target.key, suffix);
            self.report_ingress(target, outcome, &message).await;
        }
        for vs in &affected.virtual_servers {
            self.reporter
                .report(
                    &ResourceRef::new(ResourceKind::VirtualServer, vs.clone()),
                    outcome,
                    &format!("Configuration for {} was updated{}", vs, suffix),
                )
                .await;
        }
        Ok(())
    }

    // =========================================================================
    // External service
    // =========================================================================

    async fn sync_external_service(&mut self, key: &ResourceKey) -> Result<(), ControllerError> {
        if self.config.external_service_key().as_ref() != Some(key) {
            return Ok(());
        }

        let service = self.stores.services.get_by_key(key)?;
        let addresses = match (&self.config.status.external_status_address, service) {
            (Some(address), _) => vec![address.clone()],
            (None, Some(svc)) => external_addresses(&svc),
            (None, None) => Vec::new(),
        };
        info!(key = %key, addresses = ?addresses, "External service addresses changed");
        self.reporter.set_external_addresses(addresses).await;

        for ingress in self.live_ingress_keys() {
            self.reporter.update_ingress_status(&ingress).await;
        }
        Ok(())
    }

    // =========================================================================
    // VirtualServer
    // =========================================================================

    async fn sync_virtual_server(&mut self, key: &ResourceKey) -> Result<(), ControllerError> {
        let resource = ResourceRef::new(ResourceKind::VirtualServer, key.clone());

        let Some(vs) = self.stores.virtual_servers.get_by_key(key)? else {
            debug!(key = %key, "Deleting VirtualServer");
            if let Err(e) = self.configurator.remove_virtual_server(key).await {
                error!(key = %key, "Error when deleting configuration: {}", e);
            }
            return Ok(());
        };

        let site = build_virtual_server_site(vs, &self.stores, &self.resolver());
        let site = match site {
            Ok(site) => site,
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                if self.configurator.has_virtual_server(key) {
                    if let Err(e) = self.configurator.remove_virtual_server(key).await {
                        error!(key = %key, "Error when deleting configuration: {}", e);
                    }
                }
                self.reporter
                    .report(
                        &resource,
                        Outcome::Rejected,
                        &format!("VirtualServer {} is invalid and was rejected: {}", key, e),
                    )
                    .await;
                return Ok(());
            }
        };

        for diagnostic in &site.diagnostics {
            if &diagnostic.key == key {
                self.reporter
                    .report(&resource, Outcome::Ignored, &diagnostic.message)
                    .await;
                continue;
            }
            self.reporter
                .report(
                    &resource,
                    Outcome::Ignored,
                    &format!(
                        "Ignored VirtualServerRoute {}: {}",
                        diagnostic.key, diagnostic.message
                    ),
                )
                .await;
            if self
                .stores
                .virtual_server_routes
                .get_by_key(&diagnostic.key)?
                .is_some()
            {
                self.reporter
                    .report(
                        &ResourceRef::new(ResourceKind::VirtualServerRoute, diagnostic.key.clone()),
                        Outcome::Ignored,
                        &format!("Ignored by VirtualServer {}: {}", key, diagnostic.message),
                    )
                    .await;
            }
        }

        let result = self.configurator.apply_virtual_server(&site).await;
        let (outcome, suffix) = match &result {
            Ok(()) if !site.diagnostics.is_empty() => (
                Outcome::AddedOrUpdatedWithWarning,
                " with warning(s)".to_string(),
            ),
            Ok(()) => (Outcome::AddedOrUpdated, String::new()),
            Err(e) => {
                error!(key = %key, "Error adding or updating VirtualServer: {}", e);
                (
                    Outcome::AddedOrUpdatedWithError,
                    format!(", but not applied: {}", e),
                )
            }
        };

        self.reporter
            .report(
                &resource,
                outcome,
                &format!("Configuration for {} was added or updated{}", key, suffix),
            )
            .await;
        for route in site.route_keys() {
            let route_outcome = match outcome {
                Outcome::AddedOrUpdatedWithWarning => Outcome::AddedOrUpdated,
                other => other,
            };
            let route_suffix = if result.is_ok() { "" } else { suffix.as_str() };
            self.reporter
                .report(
                    &ResourceRef::new(ResourceKind::VirtualServerRoute, route.clone()),
                    route_outcome,
                    &format!("Configuration for {} was added or updated{}", route, route_suffix),
                )
                .await;
        }
        Ok(())
    }

    async fn sync_virtual_server_route(&mut self, key: &ResourceKey) -> Result<(), ControllerError> {
        let virtual_servers = find_virtual_servers_for_route(&self.stores, key)?;
        for vs in &virtual_servers {
            self.queue.enqueue(vs.as_ref());
        }

        if virtual_servers.is_empty() && self.stores.virtual_server_routes.get_by_key(key)?.is_some() {
            self.reporter
                .report(
                    &ResourceRef::new(ResourceKind::VirtualServerRoute, key.clone()),
                    Outcome::NoVirtualServersFound,
                    &format!("No VirtualServer references VirtualServerRoute {}", key),
                )
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl SyncHandler for Controller {
    async fn sync(&mut self, task: Task) {
        let started = Instant::now();
        let result = self.dispatch(&task).await;

        let status = match result {
            Ok(()) => "success",
            Err(e) if e.is_transient() => {
                self.queue.requeue(task.clone(), &e);
                "requeued"
            }
            Err(e) => {
                error!(task = %task, "Sync failed: {}", e);
                "error"
            }
        };

        record_sync(task.kind.as_str(), started.elapsed().as_secs_f64(), status);
        set_ingress_counts(self.configurator.ingress_counts());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::proxy::fake::{FakeManager, ManagerCall};
    use crate::proxy::renderer::JsonRenderer;
    use crate::reconcile::cache::MemoryStores;
    use crate::reconcile::configurator::IngressCounts;
    use crate::reconcile::params::StaticConfigParams;
    use crate::reconcile::reporter::{RecordingReporter, Report, StatusChange};
    use crate::reconcile::secrets::tests::{secret, CERT_PEM, KEY_PEM};
    use crate::reconcile::secrets::{TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};
    use crate::reconcile::virtualserver::tests::{cafe_vs, coffee_vsr, service, slice};
    use k8s_openapi::api::core::v1::ConfigMap;
    use serde_json::json;

    struct Harness {
        stores: MemoryStores,
        fake: Arc<FakeManager>,
        reporter: Arc<RecordingReporter>,
        queue: Arc<TaskQueue>,
        controller: Controller,
    }

    fn harness(config: ControllerConfig) -> Harness {
        let stores = MemoryStores::new();
        let fake = Arc::new(FakeManager::new());
        let reporter = Arc::new(RecordingReporter::new());
        let queue = Arc::new(TaskQueue::new());
        let configurator = Configurator::new(
            fake.clone(),
            Box::new(JsonRenderer::new()),
            ConfigParams::default(),
            StaticConfigParams::default(),
            config.nginx_plus,
            false,
        );
        let controller = Controller::new(
            stores.stores(),
            queue.clone(),
            configurator,
            reporter.clone(),
            config,
        );
        Harness {
            stores,
            fake,
            reporter,
            queue,
            controller,
        }
    }

    fn ingress(name: &str, value: serde_json::Value) -> Ingress {
        let mut ing: Ingress = serde_json::from_value(value).unwrap();
        ing.metadata.name = Some(name.to_string());
        ing.metadata.namespace = Some("default".to_string());
        ing
    }

    fn cafe(tls: bool) -> Ingress {
        let mut value = json!({
            "spec": {"rules": [{"host": "cafe.example.com", "http": {"paths": [
                {"path": "/tea", "pathType": "Prefix",
                 "backend": {"service": {"name": "tea-svc", "port": {"number": 80}}}}
            ]}}]}
        });
        if tls {
            value["spec"]["tls"] = json!([{"hosts": ["cafe.example.com"], "secretName": "cafe-secret"}]);
        }
        ingress("cafe", value)
    }

    fn master(name: &str) -> Ingress {
        ingress(
            name,
            json!({
                "metadata": {
                    "creationTimestamp": "2024-01-01T00:00:00Z",
                    "annotations": {"nginx.org/mergeable-ingress-type": "master"}
                },
                "spec": {"rules": [{"host": "ok.com"}]}
            }),
        )
    }

    fn minion(name: &str, created: &str, path: &str) -> Ingress {
        ingress(
            name,
            json!({
                "metadata": {
                    "creationTimestamp": created,
                    "annotations": {"nginx.org/mergeable-ingress-type": "minion"}
                },
                "spec": {"rules": [{"host": "ok.com", "http": {"paths": [
                    {"path": path, "pathType": "Prefix",
                     "backend": {"service": {"name": format!("{}-svc", name), "port": {"number": 80}}}}
                ]}}]}
            }),
        )
    }

    fn cafe_secret() -> Secret {
        secret(
            "cafe-secret",
            &[(TLS_CERT_KEY, CERT_PEM), (TLS_PRIVATE_KEY_KEY, KEY_PEM)],
        )
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("default", name)
    }

    fn outcomes(reports: &[Report]) -> Vec<Outcome> {
        reports.iter().map(|r| r.outcome).collect()
    }

    async fn sync(h: &mut Harness, kind: TaskKind, name: &str) {
        h.controller.sync(Task::new(kind, key(name))).await;
    }

    #[tokio::test]
    async fn test_simple_ingress_is_applied_and_reported() {
        let mut h = harness(ControllerConfig::default());
        h.stores.ingresses.apply(cafe(false));

        sync(&mut h, TaskKind::Ingress, "cafe").await;

        assert!(h.controller.configurator().has_fragment(&key("cafe")));
        assert_eq!(h.fake.reload_count(), 1);
        let reports = h.reporter.reports_for(&ResourceRef::ingress(&key("cafe")));
        assert_eq!(outcomes(&reports), vec![Outcome::AddedOrUpdated]);
        assert_eq!(
            reports[0].message,
            "Configuration for default/cafe was added or updated"
        );
        assert_eq!(
            h.reporter.status_changes(),
            vec![StatusChange::Updated(key("cafe"))]
        );
    }

    #[tokio::test]
    async fn test_invalid_ingress_is_rejected_and_removed() {
        let mut h = harness(ControllerConfig::default());
        h.stores.ingresses.apply(cafe(false));
        sync(&mut h, TaskKind::Ingress, "cafe").await;
        h.reporter.clear();

        // RED: a routable rule without a host
        h.stores.ingresses.apply(ingress(
            "cafe",
            json!({"spec": {"rules": [{"http": {"paths": [
                {"path": "/tea", "pathType": "Prefix",
                 "backend": {"service": {"name": "tea-svc", "port": {"number": 80}}}}
            ]}}]}}),
        ));
        sync(&mut h, TaskKind::Ingress, "cafe").await;

        assert!(!h.controller.configurator().has_fragment(&key("cafe")));
        let reports = h.reporter.reports();
        assert_eq!(outcomes(&reports), vec![Outcome::Rejected]);
        assert_eq!(
            reports[0].message,
            "default/cafe was rejected: Ingress rule contains empty host"
        );
        assert_eq!(
            h.reporter.status_changes(),
            vec![StatusChange::Cleared(key("cafe"))]
        );
        assert!(h.fake.config("default-cafe").is_none());
    }

    #[tokio::test]
    async fn test_deleted_or_reclassed_ingress_is_removed() {
        let mut h = harness(ControllerConfig::default());
        h.stores.ingresses.apply(cafe(false));
        sync(&mut h, TaskKind::Ingress, "cafe").await;

        let mut other = cafe(false);
        other
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert("kubernetes.io/ingress.class".to_string(), "other".to_string());
        h.stores.ingresses.apply(other);
        sync(&mut h, TaskKind::Ingress, "cafe").await;
        assert!(
            !h.controller.configurator().has_fragment(&key("cafe")),
            "Another class is handled like a deletion"
        );

        h.stores.ingresses.delete(&key("cafe"));
        sync(&mut h, TaskKind::Ingress, "cafe").await;
        assert!(h.controller.configurator().state().is_empty());
    }

    #[tokio::test]
    async fn test_cache_error_is_requeued() {
        let mut h = harness(ControllerConfig::default());
        h.stores.ingresses.set_unavailable(true);

        sync(&mut h, TaskKind::Ingress, "cafe").await;

        assert_eq!(h.queue.len(), 1, "Transient errors go back on the queue");
        assert!(h.reporter.reports().is_empty(), "Nothing is reported for a cache miss");
        assert!(h.fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_master_with_minions() {
        let mut h = harness(ControllerConfig::default());
        h.stores.ingresses.apply(master("cafe-master"));
        h.stores
            .ingresses
            .apply(minion("coffee", "2024-01-01T00:00:01Z", "/coffee"));
        h.stores
            .ingresses
            .apply(minion("tea", "2024-01-01T00:00:02Z", "/tea"));

        sync(&mut h, TaskKind::Ingress, "cafe-master").await;

        let configurator = h.controller.configurator();
        assert!(configurator.has_composite(&key("cafe-master"), &key("coffee")));
        assert!(configurator.has_composite(&key("cafe-master"), &key("tea")));
        assert_eq!(
            configurator.ingress_counts(),
            IngressCounts {
                master: 1,
                regular: 0,
                minion: 2
            }
        );
        assert_eq!(
            outcomes(&h.reporter.reports_for(&ResourceRef::ingress(&key("tea")))),
            vec![Outcome::AddedOrUpdated]
        );
        assert_eq!(h.reporter.status_changes().len(), 3);
    }

    #[tokio::test]
    async fn test_minion_enqueues_live_master() {
        let mut h = harness(ControllerConfig::default());
        h.stores.ingresses.apply(master("cafe-master"));
        sync(&mut h, TaskKind::Ingress, "cafe-master").await;

        h.stores
            .ingresses
            .apply(minion("coffee", "2024-01-01T00:00:01Z", "/coffee"));
        sync(&mut h, TaskKind::IngressMinion, "coffee").await;

        assert_eq!(
            h.queue.get().await,
            Some(Task::new(TaskKind::Ingress, key("cafe-master")))
        );
    }

    #[tokio::test]
    async fn test_deleted_minion_resyncs_its_master() {
        let mut h = harness(ControllerConfig::default());
        h.stores.ingresses.apply(master("cafe-master"));
        h.stores
            .ingresses
            .apply(minion("coffee", "2024-01-01T00:00:01Z", "/coffee"));
        sync(&mut h, TaskKind::Ingress, "cafe-master").await;

        h.stores.ingresses.delete(&key("coffee"));
        sync(&mut h, TaskKind::IngressMinion, "coffee").await;

        assert_eq!(
            h.queue.get().await,
            Some(Task::new(TaskKind::Ingress, key("cafe-master")))
        );
    }

    #[tokio::test]
    async fn test_minion_with_tls_is_ignored_with_one_diagnostic() {
        let mut h = harness(ControllerConfig::default());
        h.stores.ingresses.apply(master("cafe-master"));
        let mut coffee = minion("coffee", "2024-01-01T00:00:01Z", "/coffee");
        coffee.spec.as_mut().unwrap().tls = Some(vec![serde_json::from_value(
            json!({"hosts": ["ok.com"], "secretName": "cafe-secret"}),
        )
        .unwrap()]);
        h.stores.ingresses.apply(coffee);

        sync(&mut h, TaskKind::Ingress, "cafe-master").await;

        assert!(!h
            .controller
            .configurator()
            .has_composite(&key("cafe-master"), &key("coffee")));
        let reports = h.reporter.reports_for(&ResourceRef::ingress(&key("coffee")));
        assert_eq!(outcomes(&reports), vec![Outcome::Ignored]);
    }

    #[tokio::test]
    async fn test_endpoints_only_touch_live_sites() {
        let mut h = harness(ControllerConfig::default());
        h.stores.services.apply(service("tea-svc"));
        h.stores.endpoint_slices.apply(slice("tea-svc", "10.0.0.2"));
        h.stores.ingresses.apply(cafe(false));

        sync(&mut h, TaskKind::Endpoints, "tea-svc").await;
        assert!(h.fake.calls().is_empty(), "cafe is not live yet");

        sync(&mut h, TaskKind::Ingress, "cafe").await;
        h.fake.clear_calls();
        h.stores.endpoint_slices.apply(slice("tea-svc", "10.0.0.3"));
        sync(&mut h, TaskKind::Endpoints, "tea-svc").await;

        assert_eq!(h.fake.reload_count(), 1, "OSS re-applies the site once");
        let config = String::from_utf8(h.fake.config("default-cafe").unwrap()).unwrap();
        assert!(config.contains("10.0.0.3"));
        assert!(!config.contains("10.0.0.2"), "Old member is gone");
    }

    #[tokio::test]
    async fn test_removed_secret_reapplies_sites() {
        let mut h = harness(ControllerConfig::default());
        h.stores.secrets.apply(cafe_secret());
        h.stores.ingresses.apply(cafe(true));
        sync(&mut h, TaskKind::Ingress, "cafe").await;
        h.fake.clear_calls();
        h.reporter.clear();

        h.stores.secrets.delete(&key("cafe-secret"));
        sync(&mut h, TaskKind::Secret, "cafe-secret").await;

        assert_eq!(
            h.fake.calls(),
            vec![
                ManagerCall::DeleteSecret("default-cafe-secret".to_string()),
                ManagerCall::WriteConfig("default-cafe".to_string()),
                ManagerCall::Reload,
            ]
        );
        let reports = h.reporter.reports_for(&ResourceRef::ingress(&key("cafe")));
        assert_eq!(
            outcomes(&reports),
            vec![Outcome::MissingSecret, Outcome::Updated]
        );
        assert_eq!(
            reports[1].message,
            "Configuration was updated due to removed secret default/cafe-secret"
        );
    }

    #[tokio::test]
    async fn test_updated_tls_secret_reloads_once() {
        let mut h = harness(ControllerConfig::default());
        h.stores.ingresses.apply(cafe(true));
        sync(&mut h, TaskKind::Ingress, "cafe").await;
        h.fake.clear_calls();

        h.stores.secrets.apply(cafe_secret());
        sync(&mut h, TaskKind::Secret, "cafe-secret").await;

        assert_eq!(h.fake.reload_count(), 1);
        assert!(h.fake.secret("default-cafe-secret").is_some());
    }

    #[tokio::test]
    async fn test_invalid_secret_is_rejected_like_a_removal() {
        let mut h = harness(ControllerConfig::default());
        h.stores.secrets.apply(cafe_secret());
        h.stores.ingresses.apply(cafe(true));
        sync(&mut h, TaskKind::Ingress, "cafe").await;

        // RED: key removed from the secret
        h.stores
            .secrets
            .apply(secret("cafe-secret", &[(TLS_CERT_KEY, CERT_PEM)]));
        sync(&mut h, TaskKind::Secret, "cafe-secret").await;

        let rejected = h
            .reporter
            .reports_for(&ResourceRef::new(ResourceKind::Secret, key("cafe-secret")));
        assert_eq!(outcomes(&rejected), vec![Outcome::Rejected]);
        assert!(h.fake.secret("default-cafe-secret").is_none());
    }

    #[tokio::test]
    async fn test_special_secret() {
        let config = ControllerConfig {
            default_server_secret: Some("default/default-server-secret".to_string()),
            ..Default::default()
        };
        let mut h = harness(config);

        h.stores
            .secrets
            .apply(secret("default-server-secret", &[(TLS_CERT_KEY, CERT_PEM)]));
        sync(&mut h, TaskKind::Secret, "default-server-secret").await;
        let resource = ResourceRef::new(ResourceKind::Secret, key("default-server-secret"));
        assert_eq!(
            outcomes(&h.reporter.reports_for(&resource)),
            vec![Outcome::Rejected]
        );
        assert!(h.fake.secret("default").is_none(), "Previous version is kept");

        h.reporter.clear();
        h.stores.secrets.apply(secret(
            "default-server-secret",
            &[(TLS_CERT_KEY, CERT_PEM), (TLS_PRIVATE_KEY_KEY, KEY_PEM)],
        ));
        sync(&mut h, TaskKind::Secret, "default-server-secret").await;
        assert_eq!(
            outcomes(&h.reporter.reports_for(&resource)),
            vec![Outcome::Updated]
        );
        assert!(h.fake.secret("default").is_some());
    }

    #[tokio::test]
    async fn test_config_map_updates_all_sites_with_one_reload() {
        let config = ControllerConfig {
            config_map: Some("default/nginx-config".to_string()),
            ..Default::default()
        };
        let mut h = harness(config);
        h.stores.ingresses.apply(cafe(false));
        sync(&mut h, TaskKind::Ingress, "cafe").await;
        h.fake.clear_calls();

        let cm: ConfigMap = serde_json::from_value(json!({
            "metadata": {"name": "nginx-config", "namespace": "default"},
            "data": {"server-tokens": "false"}
        }))
        .unwrap();
        h.stores.config_maps.apply(cm);
        sync(&mut h, TaskKind::ConfigMap, "nginx-config").await;

        assert_eq!(h.fake.reload_count(), 1);
        assert_eq!(h.controller.configurator().params().server_tokens, "off");
        let cm_reports = h
            .reporter
            .reports_for(&ResourceRef::new(ResourceKind::ConfigMap, key("nginx-config")));
        assert_eq!(
            cm_reports[0].message,
            "Configuration from default/nginx-config was updated"
        );
        let ing_reports = h.reporter.reports_for(&ResourceRef::ingress(&key("cafe")));
        assert_eq!(
            ing_reports.last().unwrap().message,
            "Configuration for default/cafe was updated"
        );

        // RED: some other ConfigMap
        h.fake.clear_calls();
        sync(&mut h, TaskKind::ConfigMap, "unrelated").await;
        assert!(h.fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_external_service_addresses() {
        let config = ControllerConfig {
            status: crate::config::StatusConfig {
                external_service: Some("default/nginx-ingress".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut h = harness(config);
        h.stores.ingresses.apply(cafe(false));
        sync(&mut h, TaskKind::Ingress, "cafe").await;
        h.reporter.clear();

        let svc: Service = serde_json::from_value(json!({
            "metadata": {"name": "nginx-ingress", "namespace": "default"},
            "spec": {"type": "LoadBalancer", "externalIPs": ["192.0.2.10"]},
            "status": {"loadBalancer": {"ingress": [{"ip": "203.0.113.5"}, {"hostname": "lb.example.com"}]}}
        }))
        .unwrap();
        h.stores.services.apply(svc);
        sync(&mut h, TaskKind::ExternalService, "nginx-ingress").await;

        assert_eq!(
            h.reporter.external_addresses(),
            vec!["203.0.113.5", "lb.example.com", "192.0.2.10"]
        );
        assert_eq!(
            h.reporter.status_changes(),
            vec![StatusChange::Updated(key("cafe"))]
        );

        h.stores.services.delete(&key("nginx-ingress"));
        sync(&mut h, TaskKind::ExternalService, "nginx-ingress").await;
        assert!(h.reporter.external_addresses().is_empty());
    }

    #[test]
    fn test_external_name_service_address() {
        let svc: Service = serde_json::from_value(json!({
            "metadata": {"name": "ext", "namespace": "default"},
            "spec": {"type": "ExternalName", "externalName": "ingress.example.com"}
        }))
        .unwrap();
        assert_eq!(external_addresses(&svc), vec!["ingress.example.com"]);
    }

    #[tokio::test]
    async fn test_virtual_server_with_missing_route() {
        let mut h = harness(ControllerConfig::default());
        h.stores.virtual_servers.apply(cafe_vs(json!([
            {"path": "/tea", "upstream": "tea"},
            {"path": "/coffee", "route": "coffee"}
        ])));

        sync(&mut h, TaskKind::VirtualServer, "cafe").await;

        assert!(h.controller.configurator().has_virtual_server(&key("cafe")));
        let reports = h
            .reporter
            .reports_for(&ResourceRef::new(ResourceKind::VirtualServer, key("cafe")));
        assert_eq!(
            outcomes(&reports),
            vec![Outcome::Ignored, Outcome::AddedOrUpdatedWithWarning]
        );
        assert!(reports[0]
            .message
            .starts_with("Ignored VirtualServerRoute default/coffee"));

        h.stores
            .virtual_server_routes
            .apply(coffee_vsr("cafe.example.com", &["/coffee"]));
        h.reporter.clear();
        sync(&mut h, TaskKind::VirtualServer, "cafe").await;
        let route = ResourceRef::new(ResourceKind::VirtualServerRoute, key("coffee"));
        assert_eq!(
            outcomes(&h.reporter.reports_for(&route)),
            vec![Outcome::AddedOrUpdated]
        );
    }

    #[tokio::test]
    async fn test_invalid_virtual_server_is_rejected() {
        let mut h = harness(ControllerConfig::default());
        h.stores
            .virtual_servers
            .apply(cafe_vs(json!([{"path": "/tea", "upstream": "tea"}])));
        sync(&mut h, TaskKind::VirtualServer, "cafe").await;

        h.stores
            .virtual_servers
            .apply(cafe_vs(json!([{"path": "/tea", "upstream": "green"}])));
        sync(&mut h, TaskKind::VirtualServer, "cafe").await;

        assert!(!h.controller.configurator().has_virtual_server(&key("cafe")));
        let reports = h
            .reporter
            .reports_for(&ResourceRef::new(ResourceKind::VirtualServer, key("cafe")));
        assert_eq!(reports.last().unwrap().outcome, Outcome::Rejected);
    }

    #[tokio::test]
    async fn test_orphan_route_is_reported() {
        let mut h = harness(ControllerConfig::default());
        h.stores
            .virtual_server_routes
            .apply(coffee_vsr("cafe.example.com", &["/coffee"]));

        sync(&mut h, TaskKind::VirtualServerRoute, "coffee").await;

        let route = ResourceRef::new(ResourceKind::VirtualServerRoute, key("coffee"));
        let reports = h.reporter.reports_for(&route);
        assert_eq!(outcomes(&reports), vec![Outcome::NoVirtualServersFound]);
        assert_eq!(
            reports[0].message,
            "No VirtualServer references VirtualServerRoute default/coffee"
        );

        h.stores.virtual_servers.apply(cafe_vs(json!([
            {"path": "/coffee", "route": "coffee"}
        ])));
        sync(&mut h, TaskKind::VirtualServerRoute, "coffee").await;
        assert_eq!(
            h.queue.get().await,
            Some(Task::new(TaskKind::VirtualServer, key("cafe")))
        );
    }
}
