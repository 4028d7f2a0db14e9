//! Configuration loading.
//!
//! Layers, lowest to highest: built-in defaults, the TOML config file, then
//! `TANDEM__SECTION__KEY` environment variables.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::authority::RemoteAuthorityConfig;

pub const APP_NAME: &str = "tandem";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub profile: String,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub remote: RemoteConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

impl AppConfig {
    /// Copy safe to print: inline credentials are masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.remote.credential.is_some() {
            config.remote.credential = Some("********".to_string());
        }
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file; defaults to `<data_dir>/tandem.db`.
    pub path: Option<String>,
}

/// Remote authority settings.
///
/// Delegation is active only when `base_url` and a credential (inline or
/// from `credential_file`) are both present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    pub credential: Option<String>,
    pub credential_file: Option<String>,
    /// Delete `credential_file` once it has been read.
    pub discard_credential_file: bool,
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            credential: None,
            credential_file: None,
            discard_credential_file: false,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl RemoteConfig {
    /// Turn these settings into a client configuration, if delegation is on.
    ///
    /// Reading never removes the credential file; see [`activate_remote`].
    pub fn resolve(&self) -> Result<Option<RemoteAuthorityConfig>> {
        let Some(base_url) = non_empty(self.base_url.as_deref()) else {
            return Ok(None);
        };

        let credential = match non_empty(self.credential.as_deref()) {
            Some(inline) => Some(inline.to_string()),
            None => match non_empty(self.credential_file.as_deref()) {
                Some(file) => Some(read_credential_file(&expand_str_path(file)?)?),
                None => None,
            },
        };

        let Some(credential) = credential.filter(|c| !c.is_empty()) else {
            warn!(base_url, "Remote base_url set without a credential; serving locally");
            return Ok(None);
        };

        let timeout = Duration::from_secs(self.timeout_secs.max(1));
        Ok(Some(
            RemoteAuthorityConfig::new(base_url, credential).with_timeout(timeout),
        ))
    }

    /// Credential file that should be removed once its contents are saved.
    fn discardable_credential_file(&self) -> Result<Option<PathBuf>> {
        if !self.discard_credential_file || non_empty(self.credential.as_deref()).is_some() {
            return Ok(None);
        }
        non_empty(self.credential_file.as_deref())
            .map(expand_str_path)
            .transpose()
    }
}

/// Resolve the remote settings for use.
///
/// A credential read from a discardable file is first written into the
/// `[remote]` table of `config_file`, so delegation stays on for later runs
/// until `clear_remote_settings` removes it. Only then is the file deleted.
pub fn activate_remote(
    config_file: &Path,
    remote: &RemoteConfig,
) -> Result<Option<RemoteAuthorityConfig>> {
    let Some(resolved) = remote.resolve()? else {
        return Ok(None);
    };

    if let Some(file) = remote.discardable_credential_file()? {
        persist_remote_credential(config_file, &resolved.credential)?;
        discard_credential_file(&file);
    }
    Ok(Some(resolved))
}

fn read_credential_file(path: &Path) -> Result<String> {
    let credential = fs::read_to_string(path)
        .with_context(|| format!("reading credential file {}", path.display()))?
        .trim()
        .to_string();
    debug!("Read remote credential from {}", path.display());
    Ok(credential)
}

/// Store `credential` inline and drop the `credential_file` reference.
pub fn persist_remote_credential(config_file: &Path, credential: &str) -> Result<()> {
    edit_remote_table(config_file, |remote| {
        remote.remove("credential_file");
        remote.insert(
            "credential".to_string(),
            toml::Value::String(credential.to_string()),
        );
    })?;
    info!("Saved remote credential to {}", config_file.display());
    Ok(())
}

/// Remove the connection keys of the `[remote]` table, keeping other settings.
pub fn clear_remote_settings(config_file: &Path) -> Result<()> {
    edit_remote_table(config_file, |remote| {
        for key in ["base_url", "credential", "credential_file"] {
            remote.remove(key);
        }
    })
}

fn edit_remote_table(config_file: &Path, edit: impl FnOnce(&mut toml::Table)) -> Result<()> {
    let text = if config_file.exists() {
        fs::read_to_string(config_file)
            .with_context(|| format!("reading config file {}", config_file.display()))?
    } else {
        String::new()
    };
    let mut table: toml::Table = text
        .parse()
        .with_context(|| format!("parsing config file {}", config_file.display()))?;

    let remote = table
        .entry("remote")
        .or_insert(toml::Value::Table(toml::Table::new()));
    let Some(remote) = remote.as_table_mut() else {
        return Err(anyhow!(
            "[remote] in {} is not a table",
            config_file.display()
        ));
    };
    edit(remote);

    let body = toml::to_string_pretty(&table).context("serializing config to TOML")?;
    fs::write(config_file, body)
        .with_context(|| format!("writing config file to {}", config_file.display()))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Remove a credential file. Failure is logged and otherwise ignored.
pub fn discard_credential_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed credential file {}", path.display()),
        Err(err) => warn!(
            "Failed to remove credential file {}: {}",
            path.display(),
            err
        ),
    }
}

/// Resolved filesystem locations.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
}

impl AppPaths {
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }

    /// Database location after applying the config override.
    pub fn database_path(&self, cfg: &AppConfig) -> Result<PathBuf> {
        match cfg.database.path.as_deref() {
            Some(path) => expand_str_path(path),
            None => Ok(self.data_dir.join(format!("{APP_NAME}.db"))),
        }
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}",
            self.config_file.display(),
            self.data_dir.display()
        )
    }
}

/// Load configuration, writing the defaults first if no file exists yet.
pub fn load_or_init_config(paths: &AppPaths) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        write_default_config(&paths.config_file)?;
    }
    load_config(
        &paths.config_file,
        Environment::with_prefix(&env_prefix())
            .separator("__")
            .try_parsing(true),
    )
}

/// Build the layered configuration from `path` and `environment`.
pub fn load_config(path: &Path, environment: Environment) -> Result<AppConfig> {
    let built = Config::builder()
        .set_default("profile", "default")?
        .set_default("logging.level", "warn")?
        .set_default("remote.timeout_secs", DEFAULT_TIMEOUT_SECS as i64)?
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(environment)
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!(
        "# Configuration for {APP_NAME}\n# File: {}\n\n",
        path.display()
    )
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
