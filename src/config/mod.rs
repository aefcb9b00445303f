//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::NonZeroU32,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub use cli::{
    BackupArgs, BackupCommand, CliArgs, Command, MigrationsArgs, MigrationsCommand, ServeArgs,
    ServeOverrides, StoreOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "quire";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 8080;
const DEFAULT_ADMIN_PORT: u16 = 8081;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_STORE_OPERATION_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_POOL_SIZE: u32 = 10;
const DEFAULT_PING_TIMEOUT_SECS: u64 = 5;
const DEFAULT_SLOW_PING_MS: u64 = 1_000;
const DEFAULT_COLLECTIONS: [&str; 4] = ["posts", "users", "contacts", "migrations"];
const DEFAULT_API_LIMIT: u64 = 100;
const DEFAULT_API_WINDOW_SECS: u64 = 60;
const DEFAULT_AUTH_LIMIT: u64 = 10;
const DEFAULT_AUTH_WINDOW_SECS: u64 = 3_600;
const DEFAULT_USER_LIMIT: u64 = 120;
const DEFAULT_USER_WINDOW_SECS: u64 = 60;
const DEFAULT_PAGE_CACHE_TTL_SECS: u64 = 900;
const DEFAULT_SKIP_PATHS: [&str; 3] = ["/api/auth/", "/api/users/", "/admin/"];
const DEFAULT_SKIP_QUERY_PARAMS: [&str; 3] = ["_", "timestamp", "nocache"];
const DEFAULT_WRITE_QUEUE_CAPACITY: u64 = 256;
const DEFAULT_WRITE_WORKERS: u64 = 2;
const DEFAULT_CONNECTIVITY_INTERVAL_SECS: u64 = 30;
const DEFAULT_POOL_INTERVAL_SECS: u64 = 60;
const DEFAULT_COLLECTIONS_INTERVAL_SECS: u64 = 300;
const DEFAULT_SLOW_QUERY_INTERVAL_SECS: u64 = 120;
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 30;
const DEFAULT_REPORT_INTERVAL_SECS: u64 = 300;
const DEFAULT_RESPONSE_TIME_WARNING_MS: u64 = 5_000;
const DEFAULT_POOL_USAGE_WARNING: f64 = 0.9;
const DEFAULT_SLOW_QUERY_WARNING_MS: u64 = 10_000;
const DEFAULT_REPORT_SLOW_QUERY_MS: u64 = 5_000;
const DEFAULT_MAX_ISSUES: u64 = 100;
const DEFAULT_BACKUP_DIR: &str = "backups";
const DEFAULT_BACKUP_INTERVAL_SECS: u64 = 86_400;
const DEFAULT_BACKUP_RETENTION_DAYS: u64 = 30;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub database: DatabaseSettings,
    pub rate_limit: RateLimitSettings,
    pub page_cache: PageCacheSettings,
    pub health: HealthSettings,
    pub backup: BackupSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Key-value store connection. A missing URL selects the in-process store.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub url: Option<String>,
    pub operation_timeout: Duration,
}

/// Document store connection and pool sizing.
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub pool_size: NonZeroU32,
    pub ping_timeout: Duration,
    pub slow_ping: Duration,
    pub collections: Vec<String>,
}

/// A request budget: at most `limit` requests per fixed `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub limit: NonZeroU32,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub api: RateBudget,
    pub auth: RateBudget,
    pub user: RateBudget,
}

#[derive(Debug, Clone)]
pub struct PageCacheSettings {
    pub enabled: bool,
    pub ttl: Duration,
    pub skip_paths: Vec<String>,
    pub skip_query_params: Vec<String>,
    pub cache_private: bool,
    pub write_queue_capacity: usize,
    pub write_workers: usize,
}

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub connectivity_interval: Duration,
    pub pool_interval: Duration,
    pub collections_interval: Duration,
    pub slow_query_interval: Duration,
    pub metrics_interval: Duration,
    pub report_interval: Duration,
    pub response_time_warning: Duration,
    pub pool_usage_warning: f64,
    pub slow_query_warning: Duration,
    pub report_slow_query: Duration,
    pub max_issues: usize,
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub enabled: bool,
    pub directory: PathBuf,
    pub interval: Duration,
    pub retention_days: u32,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("QUIRE")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("page_cache.skip_paths")
            .with_list_parse_key("page_cache.skip_query_params")
            .with_list_parse_key("database.collections"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Migrations(args)) => raw.apply_store_overrides(&args.stores),
        Some(Command::Backup(args)) => {
            raw.apply_store_overrides(&args.stores);
            if let Some(directory) = args.directory.as_ref() {
                raw.backup.directory = Some(directory.clone());
            }
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    database: RawDatabaseSettings,
    rate_limit: RawRateLimitSettings,
    page_cache: RawPageCacheSettings,
    health: RawHealthSettings,
    backup: RawBackupSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_store_overrides(&overrides.stores);

        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(size) = overrides.database_pool_size {
            self.database.pool_size = Some(size.into());
        }
        if let Some(enabled) = overrides.page_cache_enabled {
            self.page_cache.enabled = Some(enabled);
        }
        if let Some(enabled) = overrides.backup_enabled {
            self.backup.enabled = Some(enabled);
        }
    }

    fn apply_store_overrides(&mut self, overrides: &StoreOverrides) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(url) = overrides.store_url.as_ref() {
            self.store.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            store,
            database,
            rate_limit,
            page_cache,
            health,
            backup,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            store: build_store_settings(store)?,
            database: build_database_settings(database)?,
            rate_limit: build_rate_limit_settings(rate_limit)?,
            page_cache: build_page_cache_settings(page_cache)?,
            health: build_health_settings(health)?,
            backup: build_backup_settings(backup)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;
    if public_addr == admin_addr {
        return Err(LoadError::invalid(
            "server.admin_port",
            "admin listener must not share the public address",
        ));
    }

    let graceful_shutdown = positive_secs(
        server.graceful_shutdown_seconds,
        DEFAULT_GRACEFUL_SHUTDOWN_SECS,
        "server.graceful_shutdown_seconds",
    )?;

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let url = non_blank(store.url);
    if let Some(url) = url.as_deref()
        && !(url.starts_with("redis://") || url.starts_with("rediss://"))
    {
        return Err(LoadError::invalid(
            "store.url",
            "expected a redis:// or rediss:// URL",
        ));
    }

    let operation_timeout = positive_millis(
        store.operation_timeout_ms,
        DEFAULT_STORE_OPERATION_TIMEOUT_MS,
        "store.operation_timeout_ms",
    )?;

    Ok(StoreSettings {
        url,
        operation_timeout,
    })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_blank(database.url);
    if let Some(url) = url.as_deref()
        && !(url.starts_with("http://") || url.starts_with("https://"))
    {
        return Err(LoadError::invalid(
            "database.url",
            "expected an http:// or https:// URL",
        ));
    }

    let pool_size = non_zero_u32(
        database.pool_size.unwrap_or(DEFAULT_POOL_SIZE.into()),
        "database.pool_size",
    )?;
    let ping_timeout = positive_secs(
        database.ping_timeout_secs,
        DEFAULT_PING_TIMEOUT_SECS,
        "database.ping_timeout_secs",
    )?;
    let slow_ping = positive_millis(
        database.slow_ping_ms,
        DEFAULT_SLOW_PING_MS,
        "database.slow_ping_ms",
    )?;
    if slow_ping >= ping_timeout {
        return Err(LoadError::invalid(
            "database.slow_ping_ms",
            "must be shorter than the ping timeout",
        ));
    }

    let collections = string_list(database.collections, &DEFAULT_COLLECTIONS);
    if collections.is_empty() {
        return Err(LoadError::invalid(
            "database.collections",
            "at least one collection is required",
        ));
    }

    Ok(DatabaseSettings {
        url,
        pool_size,
        ping_timeout,
        slow_ping,
        collections,
    })
}

fn build_rate_limit_settings(
    rate_limit: RawRateLimitSettings,
) -> Result<RateLimitSettings, LoadError> {
    let RawRateLimitSettings {
        api_limit,
        api_window_seconds,
        auth_limit,
        auth_window_seconds,
        user_limit,
        user_window_seconds,
    } = rate_limit;

    Ok(RateLimitSettings {
        api: RateBudget {
            limit: non_zero_u32(
                api_limit.unwrap_or(DEFAULT_API_LIMIT),
                "rate_limit.api_limit",
            )?,
            window: positive_secs(
                api_window_seconds,
                DEFAULT_API_WINDOW_SECS,
                "rate_limit.api_window_seconds",
            )?,
        },
        auth: RateBudget {
            limit: non_zero_u32(
                auth_limit.unwrap_or(DEFAULT_AUTH_LIMIT),
                "rate_limit.auth_limit",
            )?,
            window: positive_secs(
                auth_window_seconds,
                DEFAULT_AUTH_WINDOW_SECS,
                "rate_limit.auth_window_seconds",
            )?,
        },
        user: RateBudget {
            limit: non_zero_u32(
                user_limit.unwrap_or(DEFAULT_USER_LIMIT),
                "rate_limit.user_limit",
            )?,
            window: positive_secs(
                user_window_seconds,
                DEFAULT_USER_WINDOW_SECS,
                "rate_limit.user_window_seconds",
            )?,
        },
    })
}

fn build_page_cache_settings(
    page_cache: RawPageCacheSettings,
) -> Result<PageCacheSettings, LoadError> {
    let ttl = positive_secs(
        page_cache.ttl_secs,
        DEFAULT_PAGE_CACHE_TTL_SECS,
        "page_cache.ttl_secs",
    )?;

    let skip_paths = string_list(page_cache.skip_paths, &DEFAULT_SKIP_PATHS);
    if let Some(bad) = skip_paths.iter().find(|path| !path.starts_with('/')) {
        return Err(LoadError::invalid(
            "page_cache.skip_paths",
            format!("`{bad}` must start with `/`"),
        ));
    }

    let write_queue_capacity = non_zero_u32(
        page_cache
            .write_queue_capacity
            .unwrap_or(DEFAULT_WRITE_QUEUE_CAPACITY),
        "page_cache.write_queue_capacity",
    )?;
    let write_workers = non_zero_u32(
        page_cache.write_workers.unwrap_or(DEFAULT_WRITE_WORKERS),
        "page_cache.write_workers",
    )?;

    Ok(PageCacheSettings {
        enabled: page_cache.enabled.unwrap_or(true),
        ttl,
        skip_paths,
        skip_query_params: string_list(page_cache.skip_query_params, &DEFAULT_SKIP_QUERY_PARAMS),
        cache_private: page_cache.cache_private.unwrap_or(false),
        write_queue_capacity: write_queue_capacity.get() as usize,
        write_workers: write_workers.get() as usize,
    })
}

fn build_health_settings(health: RawHealthSettings) -> Result<HealthSettings, LoadError> {
    let pool_usage_warning = health
        .pool_usage_warning
        .unwrap_or(DEFAULT_POOL_USAGE_WARNING);
    if !(pool_usage_warning > 0.0 && pool_usage_warning <= 1.0) {
        return Err(LoadError::invalid(
            "health.pool_usage_warning",
            "must be within (0, 1]",
        ));
    }

    let max_issues = non_zero_u32(
        health.max_issues.unwrap_or(DEFAULT_MAX_ISSUES),
        "health.max_issues",
    )?;

    Ok(HealthSettings {
        connectivity_interval: positive_secs(
            health.connectivity_interval_secs,
            DEFAULT_CONNECTIVITY_INTERVAL_SECS,
            "health.connectivity_interval_secs",
        )?,
        pool_interval: positive_secs(
            health.pool_interval_secs,
            DEFAULT_POOL_INTERVAL_SECS,
            "health.pool_interval_secs",
        )?,
        collections_interval: positive_secs(
            health.collections_interval_secs,
            DEFAULT_COLLECTIONS_INTERVAL_SECS,
            "health.collections_interval_secs",
        )?,
        slow_query_interval: positive_secs(
            health.slow_query_interval_secs,
            DEFAULT_SLOW_QUERY_INTERVAL_SECS,
            "health.slow_query_interval_secs",
        )?,
        metrics_interval: positive_secs(
            health.metrics_interval_secs,
            DEFAULT_METRICS_INTERVAL_SECS,
            "health.metrics_interval_secs",
        )?,
        report_interval: positive_secs(
            health.report_interval_secs,
            DEFAULT_REPORT_INTERVAL_SECS,
            "health.report_interval_secs",
        )?,
        response_time_warning: positive_millis(
            health.response_time_warning_ms,
            DEFAULT_RESPONSE_TIME_WARNING_MS,
            "health.response_time_warning_ms",
        )?,
        pool_usage_warning,
        slow_query_warning: positive_millis(
            health.slow_query_warning_ms,
            DEFAULT_SLOW_QUERY_WARNING_MS,
            "health.slow_query_warning_ms",
        )?,
        report_slow_query: positive_millis(
            health.report_slow_query_ms,
            DEFAULT_REPORT_SLOW_QUERY_MS,
            "health.report_slow_query_ms",
        )?,
        max_issues: max_issues.get() as usize,
    })
}

fn build_backup_settings(backup: RawBackupSettings) -> Result<BackupSettings, LoadError> {
    let directory = backup
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "backup.directory",
            "path must not be empty",
        ));
    }

    let retention_days = non_zero_u32(
        backup.retention_days.unwrap_or(DEFAULT_BACKUP_RETENTION_DAYS),
        "backup.retention_days",
    )?;

    Ok(BackupSettings {
        enabled: backup.enabled.unwrap_or(false),
        directory,
        interval: positive_secs(
            backup.interval_secs,
            DEFAULT_BACKUP_INTERVAL_SECS,
            "backup.interval_secs",
        )?,
        retention_days: retention_days.get(),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    url: Option<String>,
    operation_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    pool_size: Option<u64>,
    ping_timeout_secs: Option<u64>,
    slow_ping_ms: Option<u64>,
    collections: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRateLimitSettings {
    api_limit: Option<u64>,
    api_window_seconds: Option<u64>,
    auth_limit: Option<u64>,
    auth_window_seconds: Option<u64>,
    user_limit: Option<u64>,
    user_window_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPageCacheSettings {
    enabled: Option<bool>,
    ttl_secs: Option<u64>,
    skip_paths: Option<Vec<String>>,
    skip_query_params: Option<Vec<String>>,
    cache_private: Option<bool>,
    write_queue_capacity: Option<u64>,
    write_workers: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawHealthSettings {
    connectivity_interval_secs: Option<u64>,
    pool_interval_secs: Option<u64>,
    collections_interval_secs: Option<u64>,
    slow_query_interval_secs: Option<u64>,
    metrics_interval_secs: Option<u64>,
    report_interval_secs: Option<u64>,
    response_time_warning_ms: Option<u64>,
    pool_usage_warning: Option<f64>,
    slow_query_warning_ms: Option<u64>,
    report_slow_query_ms: Option<u64>,
    max_issues: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackupSettings {
    enabled: Option<bool>,
    directory: Option<PathBuf>,
    interval_secs: Option<u64>,
    retention_days: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_secs(value: Option<u64>, default: u64, key: &'static str) -> Result<Duration, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn positive_millis(
    value: Option<u64>,
    default: u64,
    key: &'static str,
) -> Result<Duration, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        ms => Ok(Duration::from_millis(ms)),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn string_list(value: Option<Vec<String>>, default: &[&str]) -> Vec<String> {
    match value {
        Some(items) => items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        None => default.iter().map(|item| (*item).to_string()).collect(),
    }
}
