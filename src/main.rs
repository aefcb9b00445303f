use std::{future::IntoFuture, net::SocketAddr, process};

use quire::{
    application::{context::AppContext, error::AppError},
    config::{self, BackupCommand, MigrationsCommand},
    infra::{error::InfraError, http, telemetry},
};
use serde::Serialize;
use tokio::try_join;
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Migrations(args) => run_migrations(settings, args.command).await,
        config::Command::Backup(args) => run_backup(settings, args.command).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let ctx = AppContext::connect(settings).await?;

    if let Some(outcome) = ctx.migrations.migrate_at_startup().await? {
        info!(
            applied = outcome.applied.len(),
            skipped = outcome.skipped,
            "schema migrations up to date"
        );
    }

    let handles = ctx.spawn_background();
    let result = serve_http(&ctx).await;
    ctx.shutdown(handles).await;
    result
}

async fn serve_http(ctx: &AppContext) -> Result<(), AppError> {
    let server = &ctx.settings.server;
    let public_router = http::build_public_router(ctx.clone());
    let admin_router = http::build_admin_router(ctx.clone());

    let public_listener = tokio::net::TcpListener::bind(server.public_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let admin_listener = tokio::net::TcpListener::bind(server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        public = %server.public_addr,
        admin = %server.admin_addr,
        "listening"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received, draining connections");
            shutdown.cancel();
        }
    });

    let public_server = axum::serve(
        public_listener,
        public_router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let admin_server = axum::serve(
        admin_listener,
        admin_router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let grace = server.graceful_shutdown;
    let servers = async {
        try_join!(public_server.into_future(), admin_server.into_future())
            .map(|_| ())
            .map_err(|err| AppError::unexpected(format!("server error: {err}")))
    };
    let deadline = async {
        shutdown.cancelled().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = servers => result,
        _ = deadline => {
            warn!(
                grace_secs = grace.as_secs(),
                "graceful shutdown timed out, dropping open connections"
            );
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run_migrations(
    settings: config::Settings,
    command: MigrationsCommand,
) -> Result<(), AppError> {
    let ctx = AppContext::connect(settings).await?;
    let result = match command {
        MigrationsCommand::Migrate => ctx
            .migrations
            .migrate()
            .await
            .map_err(AppError::from)
            .and_then(|outcome| print_json(&outcome)),
        MigrationsCommand::Rollback => match ctx.migrations.rollback().await {
            Ok(Some(version)) => {
                info!(version = %version, "migration rolled back");
                Ok(())
            }
            Ok(None) => {
                info!("no applied migrations to roll back");
                Ok(())
            }
            Err(err) => Err(err.into()),
        },
        MigrationsCommand::Status => ctx
            .migrations
            .status()
            .await
            .map_err(AppError::from)
            .and_then(|status| print_json(&status)),
    };
    ctx.shutdown(Vec::new()).await;
    result
}

async fn run_backup(settings: config::Settings, command: BackupCommand) -> Result<(), AppError> {
    let ctx = AppContext::connect(settings).await?;
    let backups = &ctx.backups;
    let result = match command {
        BackupCommand::Create => backups
            .create_backup()
            .await
            .map_err(AppError::from)
            .and_then(|metadata| print_json(&metadata)),
        BackupCommand::Restore { path } => backups
            .restore_backup(&path)
            .await
            .map_err(AppError::from)
            .and_then(|summaries| print_json(&summaries)),
        BackupCommand::Cleanup { retention_days } => {
            let days = retention_days.unwrap_or_else(|| backups.retention_days());
            backups
                .cleanup_old_backups(days)
                .await
                .map(|removed| info!(removed, retention_days = days, "old backups removed"))
                .map_err(AppError::from)
        }
        BackupCommand::List => backups
            .list_backups()
            .await
            .map_err(AppError::from)
            .and_then(|list| print_json(&list)),
    };
    ctx.shutdown(Vec::new()).await;
    result
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
