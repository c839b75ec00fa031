//! Configuration loading and root folder resolution
//!
//! Root folder resolution priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`SIRENA_ROOT_FOLDER`, then `SIRENA_ROOT`)
//! 3. TOML config file (`~/.config/sirena/<module>.toml`)
//! 4. OS-dependent compiled default (fallback)
//!
//! The root folder holds `sirena.db` and the `uploads/` directory. Runtime
//! tuning lives in the database `settings` table; only bootstrap concerns
//! (paths, logging) belong in the TOML file. Secrets (OIDC credentials,
//! Demat Social token) come from environment variables only and are never
//! written to disk by SIRENA.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Compiled default paths and logging for the current platform
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub root_folder: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl CompiledDefaults {
    pub fn for_current_platform() -> Self {
        let root_folder = if cfg!(target_os = "linux") {
            dirs::data_local_dir()
                .map(|d| d.join("sirena"))
                .unwrap_or_else(|| PathBuf::from("/var/lib/sirena"))
        } else if cfg!(target_os = "macos") {
            dirs::data_dir()
                .map(|d| d.join("sirena"))
                .unwrap_or_else(|| PathBuf::from("/Library/Application Support/sirena"))
        } else if cfg!(target_os = "windows") {
            dirs::data_local_dir()
                .map(|d| d.join("sirena"))
                .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\sirena"))
        } else {
            PathBuf::from("./sirena_data")
        };

        Self {
            root_folder,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

/// Bootstrap configuration loaded from the per-module TOML file
///
/// These settings cannot change during runtime. The service must restart
/// to pick up changes to the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder for database and uploads (optional)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Root folder resolution following the 4-tier priority order
pub struct RootFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            cli_arg: None,
        }
    }

    /// Attach a command-line override (highest priority)
    pub fn with_cli_arg(mut self, cli_arg: Option<PathBuf>) -> Self {
        self.cli_arg = cli_arg;
        self
    }

    /// Resolve the root folder; never fails, falls back to compiled defaults
    pub fn resolve(&self) -> PathBuf {
        // Priority 1: Command-line argument
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        // Priority 2: Environment variables
        if let Ok(path) = std::env::var("SIRENA_ROOT_FOLDER") {
            return PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("SIRENA_ROOT") {
            return PathBuf::from(path);
        }

        // Priority 3: TOML config file
        if let Some(config) = self.load_config_file() {
            if let Some(root_folder) = config.root_folder {
                return root_folder;
            }
        }

        // Priority 4: OS-dependent compiled default
        CompiledDefaults::for_current_platform().root_folder
    }

    /// Load the per-module TOML config file, if one exists
    pub fn load_config_file(&self) -> Option<TomlConfig> {
        let path = self.config_file_path()?;
        if !path.exists() {
            return None;
        }

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Could not read config file {}: {}", path.display(), e);
                return None;
            }
        };

        match toml::from_str::<TomlConfig>(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Could not parse config file {}: {}", path.display(), e);
                None
            }
        }
    }

    fn config_file_path(&self) -> Option<PathBuf> {
        let user_config = dirs::config_dir()
            .map(|d| d.join("sirena").join(format!("{}.toml", self.module_name)));

        if let Some(path) = &user_config {
            if path.exists() {
                return user_config;
            }
        }

        let system_config = PathBuf::from("/etc/sirena").join(format!("{}.toml", self.module_name));
        if system_config.exists() {
            return Some(system_config);
        }

        user_config
    }
}

/// Root folder initialization: directory creation and derived paths
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    /// Create the root folder and the uploads directory if missing.
    /// Safe to call multiple times.
    pub fn ensure_directory_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_folder)?;
        std::fs::create_dir_all(self.uploads_path())?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join("sirena.db")
    }

    pub fn uploads_path(&self) -> PathBuf {
        self.root_folder.join("uploads")
    }

    pub fn database_exists(&self) -> bool {
        self.database_path().exists()
    }
}

/// Module configuration from database
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    pub module_name: String,
    pub host: String,
    pub port: u16,
    pub enabled: bool,
}

/// Load module configuration from database
pub async fn load_module_config(db: &sqlx::SqlitePool, module_name: &str) -> Result<ModuleConfig> {
    let record = sqlx::query_as::<_, (String, String, i64, i64)>(
        "SELECT module_name, host, port, enabled FROM module_config WHERE module_name = ?",
    )
    .bind(module_name)
    .fetch_one(db)
    .await?;

    Ok(ModuleConfig {
        module_name: record.0,
        host: record.1,
        port: record.2 as u16,
        enabled: record.3 != 0,
    })
}

fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(Error::Config(format!(
            "Missing required environment variable: {}",
            name
        ))),
    }
}

/// OIDC provider settings, loaded from the environment
#[derive(Debug, Clone)]
pub struct OidcSettings {
    /// Issuer URL, used for discovery and `iss` validation
    pub issuer_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Redirect URL registered with the provider (the /auth/callback URL)
    pub redirect_url: String,
    /// Space-separated scope list
    pub scopes: String,
    /// Post-login and post-logout landing page
    pub frontend_url: String,
}

impl OidcSettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            issuer_url: require_env("SIRENA_OIDC_ISSUER_URL")?,
            client_id: require_env("SIRENA_OIDC_CLIENT_ID")?,
            client_secret: require_env("SIRENA_OIDC_CLIENT_SECRET")?,
            redirect_url: require_env("SIRENA_OIDC_REDIRECT_URL")?,
            scopes: std::env::var("SIRENA_OIDC_SCOPES")
                .unwrap_or_else(|_| "openid email given_name usual_name".to_string()),
            frontend_url: std::env::var("SIRENA_FRONTEND_URL").unwrap_or_else(|_| "/".to_string()),
        })
    }
}

/// Demat Social API settings, loaded from the environment
#[derive(Debug, Clone)]
pub struct DematSocialSettings {
    /// GraphQL endpoint URL
    pub api_url: String,
    /// Bearer token
    pub api_token: String,
    /// Number of the démarche to poll
    pub demarche_number: i64,
}

impl DematSocialSettings {
    pub fn from_env() -> Result<Self> {
        let demarche = require_env("SIRENA_DEMAT_SOCIAL_DEMARCHE")?;
        let demarche_number = demarche.parse::<i64>().map_err(|_| {
            Error::Config(format!(
                "SIRENA_DEMAT_SOCIAL_DEMARCHE must be a number, got: {}",
                demarche
            ))
        })?;

        Ok(Self {
            api_url: require_env("SIRENA_DEMAT_SOCIAL_API_URL")?,
            api_token: require_env("SIRENA_DEMAT_SOCIAL_API_TOKEN")?,
            demarche_number,
        })
    }
}

/// clamd (ClamAV daemon) settings, loaded from the environment
#[derive(Debug, Clone)]
pub struct ClamdSettings {
    pub host: String,
    pub port: u16,
    /// When true, uploads are stored unscanned with scan status PENDING
    pub disabled: bool,
}

impl ClamdSettings {
    pub fn from_env_or_default() -> Self {
        let host =
            std::env::var("SIRENA_CLAMD_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = std::env::var("SIRENA_CLAMD_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(3310);
        let disabled = std::env::var("SIRENA_CLAMD_DISABLED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            host,
            port,
            disabled,
        }
    }
}
