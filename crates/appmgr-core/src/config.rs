use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{AppMgrError, Result};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_FOOTER_PATH: &str = "/etc/appmgr/footer.html";

pub const ENV_PORT: &str = "PORT";
pub const ENV_SITE_URL: &str = "SITEURL";
pub const ENV_PROXIED: &str = "PROXIED";
pub const ENV_APP_ENV: &str = "APP_ENV";

/// Keys describing objects the server creates. They are results, never input.
const OUTPUT_ONLY_KEYS: &[&str] = &["server", "app", "listener"];

/// Raw server configuration as written by the caller or read from TOML.
///
/// Every field is optional; [`ServerConfig::resolve`] fills the gaps from
/// the environment and built-in defaults exactly once.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub host: Option<String>,
    /// `Some(0)` asks the OS for a free port.
    pub port: Option<u16>,
    pub site_url: Option<String>,
    pub proxied: Option<bool>,
    pub root_directory: Option<PathBuf>,
    pub manual_start: bool,
    pub silent: bool,
    pub production_mode: Option<bool>,
    pub footer_path: Option<PathBuf>,
    /// Keys not understood by this version.
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

/// Configuration after the fallback chains have been applied. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub host: String,
    pub port: u16,
    /// `None` until the listener is bound, unless given explicitly.
    pub site_url: Option<String>,
    pub proxied: bool,
    pub root_directory: PathBuf,
    pub manual_start: bool,
    pub silent: bool,
    pub production_mode: bool,
    pub footer_path: PathBuf,
}

impl ServerConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source)
            .map_err(|e| AppMgrError::Configuration(format!("invalid TOML configuration: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            AppMgrError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// Resolves against the process environment.
    pub fn resolve(self) -> Result<ResolvedConfig> {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    /// Resolves against an arbitrary environment lookup.
    ///
    /// ```text
    /// port            explicit > $PORT    > 8080
    /// site_url        explicit > $SITEURL > computed after bind
    /// proxied         explicit > $PROXIED > false
    /// production_mode explicit > $APP_ENV == "production" > false
    /// root_directory  explicit > current working directory (warns)
    /// ```
    pub fn resolve_with<E>(self, env: E) -> Result<ResolvedConfig>
    where
        E: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        for key in self.extra.keys() {
            if OUTPUT_ONLY_KEYS.contains(&key.as_str()) {
                return Err(AppMgrError::Configuration(format!(
                    "`{key}` is only a return value and cannot be configured"
                )));
            }
            tracing::warn!("Ignoring unknown configuration key `{}`", key);
        }

        let port = match self.port {
            Some(port) => port,
            None => match env(ENV_PORT) {
                Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                    AppMgrError::Configuration(format!("{ENV_PORT}={raw:?} is not a valid port"))
                })?,
                None => DEFAULT_PORT,
            },
        };

        let site_url = match self.site_url.or_else(|| env(ENV_SITE_URL)) {
            Some(url) => Some(normalize_site_url(&url)?),
            None => None,
        };

        let proxied = self
            .proxied
            .unwrap_or_else(|| env(ENV_PROXIED).map(|v| is_truthy(&v)).unwrap_or(false));

        let production_mode = self.production_mode.unwrap_or_else(|| {
            env(ENV_APP_ENV)
                .map(|v| v.trim().eq_ignore_ascii_case("production"))
                .unwrap_or(false)
        });

        let root_directory = match self.root_directory {
            Some(dir) => dir,
            None => {
                let cwd = std::env::current_dir().map_err(|e| {
                    AppMgrError::Configuration(format!("no root directory and no working directory: {e}"))
                })?;
                tracing::warn!(
                    "No root directory configured, serving from {}",
                    cwd.display()
                );
                cwd
            }
        };

        Ok(ResolvedConfig {
            host: self.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            site_url,
            proxied,
            root_directory,
            manual_start: self.manual_start,
            silent: self.silent,
            production_mode,
            footer_path: self
                .footer_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FOOTER_PATH)),
        })
    }
}

fn normalize_site_url(url: &str) -> Result<String> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(AppMgrError::Configuration(format!(
            "site url {url:?} must start with http:// or https://"
        )));
    }
    Ok(url.trim_end_matches('/').to_string())
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
