use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the Quire binary.
#[derive(Debug, Parser)]
#[command(name = "quire", version, about = "Quire CMS coordination service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "QUIRE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the public and admin HTTP services.
    Serve(Box<ServeArgs>),
    /// Apply, roll back, or inspect document-store migrations.
    #[command(name = "migrations")]
    Migrations(MigrationsArgs),
    /// Create, restore, prune, or list collection backups.
    #[command(name = "backup")]
    Backup(BackupArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverrides {
    /// Override the document store URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the key-value store URL.
    #[arg(long = "store-url", value_name = "URL")]
    pub store_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub stores: StoreOverrides,

    /// Override the public listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the administrative listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub server_admin_host: Option<String>,

    /// Override the public listener port.
    #[arg(long = "server-public-port", value_name = "PORT")]
    pub public_port: Option<u16>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the number of pooled document-store handles.
    #[arg(long = "database-pool-size", value_name = "COUNT")]
    pub database_pool_size: Option<u32>,

    /// Toggle the page cache.
    #[arg(
        long = "page-cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub page_cache_enabled: Option<bool>,

    /// Toggle the scheduled backup loop.
    #[arg(
        long = "backup-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub backup_enabled: Option<bool>,
}

#[derive(Debug, Args, Clone)]
pub struct MigrationsArgs {
    #[command(flatten)]
    pub stores: StoreOverrides,

    #[command(subcommand)]
    pub command: MigrationsCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum MigrationsCommand {
    /// Apply every pending migration in version order.
    Migrate,
    /// Revert the most recently applied migration.
    Rollback,
    /// Print applied and pending migrations.
    Status,
}

#[derive(Debug, Args, Clone)]
pub struct BackupArgs {
    #[command(flatten)]
    pub stores: StoreOverrides,

    /// Override the directory holding backup runs.
    #[arg(long = "backup-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub directory: Option<PathBuf>,

    #[command(subcommand)]
    pub command: BackupCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum BackupCommand {
    /// Snapshot every configured collection.
    Create,
    /// Destructively restore collections from a backup directory.
    Restore {
        /// Backup run directory to restore from.
        #[arg(value_name = "PATH", value_hint = ValueHint::DirPath)]
        path: PathBuf,
    },
    /// Delete backup runs older than the retention period.
    Cleanup {
        /// Override the configured retention period.
        #[arg(long = "retention-days", value_name = "DAYS")]
        retention_days: Option<u32>,
    },
    /// List backup runs, newest first.
    List,
}
