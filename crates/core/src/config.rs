use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub services: ServicesConfig,
    pub storage: StorageConfig,
    pub sessions: SessionsConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
    pub max_upload_bytes: usize,
    pub max_files_per_request: usize,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServicesConfig {
    pub analysis_base_url: String,
    pub transformation_base_url: String,
    pub request_timeout_secs: u64,
    pub transformation_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub stale_file_hours: u64,
}

#[derive(Clone, Debug)]
pub struct SessionsConfig {
    pub inactivity_hours: u64,
    pub sweep_interval_secs: u64,
    pub auto_adopt_transformations: bool,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: Option<String>,
    pub storage_root: Option<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
                max_upload_bytes: 10 * 1024 * 1024,
                max_files_per_request: 5,
            },
            llm: LlmConfig {
                api_key: String::new().into(),
                base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                model: "gemini-2.5-flash".to_string(),
                timeout_secs: 60,
            },
            services: ServicesConfig {
                analysis_base_url: "http://localhost:8002/api/v1".to_string(),
                transformation_base_url: "http://localhost:8001/api/v1".to_string(),
                request_timeout_secs: 30,
                transformation_timeout_secs: 60,
            },
            storage: StorageConfig { root: PathBuf::from("uploads"), stale_file_hours: 24 },
            sessions: SessionsConfig {
                inactivity_hours: 24,
                sweep_interval_secs: 3600,
                auto_adopt_transformations: true,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("pricewise.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
            if let Some(max_upload_bytes) = server.max_upload_bytes {
                self.server.max_upload_bytes = max_upload_bytes;
            }
            if let Some(max_files_per_request) = server.max_files_per_request {
                self.server.max_files_per_request = max_files_per_request;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = api_key.into();
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(services) = patch.services {
            if let Some(url) = services.analysis_base_url {
                self.services.analysis_base_url = url;
            }
            if let Some(url) = services.transformation_base_url {
                self.services.transformation_base_url = url;
            }
            if let Some(secs) = services.request_timeout_secs {
                self.services.request_timeout_secs = secs;
            }
            if let Some(secs) = services.transformation_timeout_secs {
                self.services.transformation_timeout_secs = secs;
            }
        }

        if let Some(storage) = patch.storage {
            if let Some(root) = storage.root {
                self.storage.root = root;
            }
            if let Some(hours) = storage.stale_file_hours {
                self.storage.stale_file_hours = hours;
            }
        }

        if let Some(sessions) = patch.sessions {
            if let Some(hours) = sessions.inactivity_hours {
                self.sessions.inactivity_hours = hours;
            }
            if let Some(secs) = sessions.sweep_interval_secs {
                self.sessions.sweep_interval_secs = secs;
            }
            if let Some(auto_adopt) = sessions.auto_adopt_transformations {
                self.sessions.auto_adopt_transformations = auto_adopt;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("PRICEWISE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("PRICEWISE_SERVER_PORT") {
            self.server.port = parse_env("PRICEWISE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("PRICEWISE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_env("PRICEWISE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }
        if let Some(value) = read_env("PRICEWISE_SERVER_MAX_UPLOAD_BYTES") {
            self.server.max_upload_bytes = parse_env("PRICEWISE_SERVER_MAX_UPLOAD_BYTES", &value)?;
        }
        if let Some(value) = read_env("PRICEWISE_SERVER_MAX_FILES_PER_REQUEST") {
            self.server.max_files_per_request =
                parse_env("PRICEWISE_SERVER_MAX_FILES_PER_REQUEST", &value)?;
        }

        // GEMINI_API_KEY is what most local setups already export.
        let api_key = read_env("PRICEWISE_LLM_API_KEY").or_else(|| read_env("GEMINI_API_KEY"));
        if let Some(value) = api_key {
            self.llm.api_key = value.into();
        }
        if let Some(value) = read_env("PRICEWISE_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("PRICEWISE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("PRICEWISE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_env("PRICEWISE_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("PRICEWISE_SERVICES_ANALYSIS_BASE_URL") {
            self.services.analysis_base_url = value;
        }
        if let Some(value) = read_env("PRICEWISE_SERVICES_TRANSFORMATION_BASE_URL") {
            self.services.transformation_base_url = value;
        }
        if let Some(value) = read_env("PRICEWISE_SERVICES_REQUEST_TIMEOUT_SECS") {
            self.services.request_timeout_secs =
                parse_env("PRICEWISE_SERVICES_REQUEST_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("PRICEWISE_SERVICES_TRANSFORMATION_TIMEOUT_SECS") {
            self.services.transformation_timeout_secs =
                parse_env("PRICEWISE_SERVICES_TRANSFORMATION_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("PRICEWISE_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(value);
        }
        if let Some(value) = read_env("PRICEWISE_STORAGE_STALE_FILE_HOURS") {
            self.storage.stale_file_hours =
                parse_env("PRICEWISE_STORAGE_STALE_FILE_HOURS", &value)?;
        }

        if let Some(value) = read_env("PRICEWISE_SESSIONS_INACTIVITY_HOURS") {
            self.sessions.inactivity_hours =
                parse_env("PRICEWISE_SESSIONS_INACTIVITY_HOURS", &value)?;
        }
        if let Some(value) = read_env("PRICEWISE_SESSIONS_SWEEP_INTERVAL_SECS") {
            self.sessions.sweep_interval_secs =
                parse_env("PRICEWISE_SESSIONS_SWEEP_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("PRICEWISE_SESSIONS_AUTO_ADOPT_TRANSFORMATIONS") {
            self.sessions.auto_adopt_transformations =
                parse_env("PRICEWISE_SESSIONS_AUTO_ADOPT_TRANSFORMATIONS", &value)?;
        }

        let log_level =
            read_env("PRICEWISE_LOGGING_LEVEL").or_else(|| read_env("PRICEWISE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("PRICEWISE_LOGGING_FORMAT").or_else(|| read_env("PRICEWISE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(api_key) = overrides.llm_api_key {
            self.llm.api_key = api_key.into();
        }
        if let Some(model) = overrides.llm_model {
            self.llm.model = model;
        }
        if let Some(root) = overrides.storage_root {
            self.storage.root = root;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_server(&self.server)?;
        validate_llm(&self.llm)?;
        validate_services(&self.services)?;
        validate_storage(&self.storage)?;
        validate_sessions(&self.sessions)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("pricewise.toml"), PathBuf::from("config/pricewise.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    if server.max_upload_bytes == 0 {
        return Err(ConfigError::Validation(
            "server.max_upload_bytes must be greater than zero".to_string(),
        ));
    }

    if server.max_files_per_request == 0 {
        return Err(ConfigError::Validation(
            "server.max_files_per_request must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.api_key.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "llm.api_key is required. Set PRICEWISE_LLM_API_KEY or GEMINI_API_KEY".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    validate_http_url("llm.base_url", &llm.base_url)?;

    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_services(services: &ServicesConfig) -> Result<(), ConfigError> {
    validate_http_url("services.analysis_base_url", &services.analysis_base_url)?;
    validate_http_url("services.transformation_base_url", &services.transformation_base_url)?;

    if services.request_timeout_secs == 0 || services.request_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "services.request_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if services.transformation_timeout_secs == 0 || services.transformation_timeout_secs > 900 {
        return Err(ConfigError::Validation(
            "services.transformation_timeout_secs must be in range 1..=900".to_string(),
        ));
    }

    Ok(())
}

fn validate_storage(storage: &StorageConfig) -> Result<(), ConfigError> {
    if storage.root.as_os_str().is_empty() {
        return Err(ConfigError::Validation("storage.root must not be empty".to_string()));
    }

    if storage.stale_file_hours == 0 {
        return Err(ConfigError::Validation(
            "storage.stale_file_hours must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_sessions(sessions: &SessionsConfig) -> Result<(), ConfigError> {
    if sessions.inactivity_hours == 0 {
        return Err(ConfigError::Validation(
            "sessions.inactivity_hours must be greater than zero".to_string(),
        ));
    }

    if sessions.sweep_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "sessions.sweep_interval_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!("{field} must start with http:// or https://")))
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    server: Option<ServerPatch>,
    llm: Option<LlmPatch>,
    services: Option<ServicesPatch>,
    storage: Option<StoragePatch>,
    sessions: Option<SessionsPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    max_upload_bytes: Option<usize>,
    max_files_per_request: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServicesPatch {
    analysis_base_url: Option<String>,
    transformation_base_url: Option<String>,
    request_timeout_secs: Option<u64>,
    transformation_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct StoragePatch {
    root: Option<PathBuf>,
    stale_file_hours: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionsPatch {
    inactivity_hours: Option<u64>,
    sweep_interval_secs: Option<u64>,
    auto_adopt_transformations: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
