//! Proxy process manager
//!
//! Owns the on-disk layout of the proxy configuration and the reload cycle:
//!
//! ```text
//!  <conf>/nginx.conf               main config
//!  <conf>/conf.d/<name>.conf       one file per site
//!  <conf>/secrets/<name>           TLS PEMs and JWK files
//!  <conf>/config-version.conf      version served on the version endpoint
//! ```
//!
//! A reload bumps the config version, rewrites the version file, signals the
//! proxy and then polls the version endpoint until the new version is live.

use async_trait::async_trait;
use common::ServerParams;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::plus::ApiClient;
use crate::apis::metrics;

const CONFIG_FILE_MODE: u32 = 0o644;
const VERSION_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("nginx reload failed: {0}")]
    Reload(String),

    #[error("could not get newest config version {version} within {timeout:?}")]
    VersionTimeout { version: u64, timeout: Duration },

    #[error("API error: {0}")]
    Api(String),

    #[error("The upstream API is not available on this proxy")]
    Unsupported,
}

/// Everything the Configurator needs from the proxy process
#[async_trait]
pub trait ProxyManager: Send + Sync {
    async fn write_main_config(&self, content: &[u8]) -> Result<(), ManagerError>;

    /// Create or overwrite `conf.d/<name>.conf`
    async fn write_config(&self, name: &str, content: &[u8]) -> Result<(), ManagerError>;

    /// Remove `conf.d/<name>.conf`. A missing file is not an error.
    async fn delete_config(&self, name: &str) -> Result<(), ManagerError>;

    /// Write a secret file atomically and return its path
    async fn write_secret(&self, name: &str, content: &[u8], mode: u32) -> Result<String, ManagerError>;

    async fn delete_secret(&self, name: &str) -> Result<(), ManagerError>;

    fn secret_path(&self, name: &str) -> String;

    /// Reload and wait until the proxy reports the new config version
    async fn reload(&self) -> Result<(), ManagerError>;

    /// Replace the members of one upstream without a reload
    async fn update_upstream_members(
        &self,
        upstream: &str,
        members: &[String],
        params: &ServerParams,
    ) -> Result<(), ManagerError>;
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ManagerError + '_ {
    move |source| ManagerError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Write through a temp file in the same directory, then rename
async fn write_atomically(path: &Path, content: &[u8], mode: u32) -> Result<(), ManagerError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await.map_err(io_error(dir))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.tmp", file_name));

    tokio::fs::write(&tmp, content).await.map_err(io_error(&tmp))?;
    tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(io_error(&tmp))?;
    tokio::fs::rename(&tmp, path).await.map_err(io_error(path))?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), ManagerError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("{} was already removed", path.display());
            Ok(())
        }
        Err(e) => Err(io_error(path)(e)),
    }
}

/// Manager for a proxy running next to the controller
pub struct LocalManager {
    conf_d: PathBuf,
    secrets: PathBuf,
    main_conf: PathBuf,
    version_file: PathBuf,
    binary: String,
    version_url: String,
    plus_api_url: Option<String>,
    reload_timeout: Duration,
    config_version: AtomicU64,
    client: ApiClient,
}

impl LocalManager {
    pub fn new(
        conf_path: impl AsRef<Path>,
        binary: impl Into<String>,
        version_url: impl Into<String>,
        plus_api_url: Option<String>,
        reload_timeout: Duration,
    ) -> Self {
        let root = conf_path.as_ref();
        Self {
            conf_d: root.join("conf.d"),
            secrets: root.join("secrets"),
            main_conf: root.join("nginx.conf"),
            version_file: root.join("config-version.conf"),
            binary: binary.into(),
            version_url: version_url.into(),
            plus_api_url,
            reload_timeout,
            config_version: AtomicU64::new(0),
            client: ApiClient::new(),
        }
    }

    pub fn config_version(&self) -> u64 {
        self.config_version.load(Ordering::SeqCst)
    }

    fn config_file(&self, name: &str) -> PathBuf {
        self.conf_d.join(format!("{}.conf", name))
    }

    /// The version endpoint answers with the version and checks the header the
    /// upstream API client sends
    async fn write_version_file(&self, version: u64) -> Result<(), ManagerError> {
        let content = format!(
            "server {{\n    listen unix:/var/lib/nginx/nginx-config-version.sock;\n    access_log off;\n\n    location /configVersion {{\n        return 200 {version};\n    }}\n}}\n\nmap $http_x_expected_config_version $config_version_mismatch {{\n    \"{version}\" \"\";\n    default \"mismatch\";\n}}\n",
            version = version
        );
        write_atomically(&self.version_file, content.as_bytes(), CONFIG_FILE_MODE).await
    }

    async fn wait_for_version(&self, version: u64) -> Result<(), ManagerError> {
        let deadline = Instant::now() + self.reload_timeout;
        loop {
            match self.client.config_version(&self.version_url).await {
                Ok(current) if current == version => return Ok(()),
                Ok(current) => debug!(current, expected = version, "Proxy still runs an older config"),
                Err(e) => debug!("Config version not available yet: {}", e),
            }
            if Instant::now() >= deadline {
                return Err(ManagerError::VersionTimeout {
                    version,
                    timeout: self.reload_timeout,
                });
            }
            tokio::time::sleep(VERSION_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ProxyManager for LocalManager {
    async fn write_main_config(&self, content: &[u8]) -> Result<(), ManagerError> {
        debug!("Writing main config to {}", self.main_conf.display());
        write_atomically(&self.main_conf, content, CONFIG_FILE_MODE).await
    }

    async fn write_config(&self, name: &str, content: &[u8]) -> Result<(), ManagerError> {
        let path = self.config_file(name);
        debug!("Writing config to {}", path.display());
        write_atomically(&path, content, CONFIG_FILE_MODE).await
    }

    async fn delete_config(&self, name: &str) -> Result<(), ManagerError> {
        let path = self.config_file(name);
        debug!("Deleting config from {}", path.display());
        remove_if_exists(&path).await
    }

    async fn write_secret(&self, name: &str, content: &[u8], mode: u32) -> Result<String, ManagerError> {
        let path = self.secrets.join(name);
        debug!("Writing secret to {}", path.display());
        write_atomically(&path, content, mode).await?;
        Ok(path.display().to_string())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), ManagerError> {
        let path = self.secrets.join(name);
        debug!("Deleting secret from {}", path.display());
        remove_if_exists(&path).await
    }

    fn secret_path(&self, name: &str) -> String {
        self.secrets.join(name).display().to_string()
    }

    async fn reload(&self) -> Result<(), ManagerError> {
        let version = self.config_version.fetch_add(1, Ordering::SeqCst) + 1;
        self.write_version_file(version).await?;

        info!(version, "Reloading nginx");
        let started = Instant::now();

        let output = Command::new(&self.binary)
            .args(["-s", "reload"])
            .output()
            .await
            .map_err(|e| {
                metrics::record_reload_error();
                ManagerError::Reload(e.to_string())
            })?;
        if !output.status.success() {
            metrics::record_reload_error();
            return Err(ManagerError::Reload(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        if let Err(e) = self.wait_for_version(version).await {
            metrics::record_reload_error();
            return Err(e);
        }

        metrics::record_reload(started.elapsed());
        Ok(())
    }

    async fn update_upstream_members(
        &self,
        upstream: &str,
        members: &[String],
        params: &ServerParams,
    ) -> Result<(), ManagerError> {
        let Some(base) = self.plus_api_url.as_deref() else {
            return Err(ManagerError::Unsupported);
        };
        self.client
            .verify_config_version(base, self.config_version())
            .await?;
        let (added, removed) = self
            .client
            .update_http_servers(base, upstream, members, params)
            .await
            .inspect_err(|e| warn!("Couldn't update servers of {} upstream: {}", upstream, e))?;
        debug!(upstream, added, removed, "Updated upstream members");
        Ok(())
    }
}
