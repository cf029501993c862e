use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

mod admin;
mod config;
mod logging;

use config::Config;

/// Stateful call router between a signaling switch and its voice
/// providers.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "tandem.yaml", env = "TANDEM_CONFIG")]
    config: PathBuf,

    /// Use built-in defaults when the configuration file is absent.
    #[arg(long, action(clap::ArgAction::SetTrue))]
    allow_missing_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the router (the default).
    Run,
    /// Create the schema and the switch bootstrap rows, then exit.
    Bootstrap,
    /// Provider administration.
    Provider {
        #[command(subcommand)]
        action: ProviderAction,
    },
    /// Route administration.
    Route {
        #[command(subcommand)]
        action: RouteAction,
    },
    /// Provider group administration.
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },
    /// DID pool administration.
    Did {
        #[command(subcommand)]
        action: DidAction,
    },
}

#[derive(Debug, Subcommand)]
enum ProviderAction {
    /// Create or update a provider from a YAML definition.
    Upsert { file: PathBuf },
    /// Delete a provider and its switch configuration rows.
    Delete { name: String },
}

#[derive(Debug, Subcommand)]
enum RouteAction {
    /// Create or update a route from a YAML definition.
    Upsert { file: PathBuf },
    /// Delete a route.
    Delete { name: String },
}

#[derive(Debug, Subcommand)]
enum GroupAction {
    /// Create or update a group from a YAML definition, then materialize
    /// its rule membership.
    Upsert { file: PathBuf },
    /// Re-evaluate a group's rules into the membership table.
    Refresh { name: String },
    /// Add a provider to a group by hand. Manual members survive rule
    /// refreshes; this is the only way to populate a `manual` group.
    AddMember {
        group: String,
        provider: String,
        /// Priority override shadowing the provider's own value.
        #[arg(long)]
        priority: Option<i32>,
        /// Weight override shadowing the provider's own value.
        #[arg(long)]
        weight: Option<i32>,
    },
    /// Remove a provider from a group.
    RemoveMember { group: String, provider: String },
    /// Delete a group and its membership rows.
    Delete { name: String },
}

#[derive(Debug, Subcommand)]
enum DidAction {
    /// Load numbers into the pool, one per line.
    Load {
        file: PathBuf,
        /// Owning provider; omitted rows serve any provider.
        #[arg(long)]
        provider: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::install();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else if cli.allow_missing_config {
        tracing::warn!(path = %cli.config.display(), "config file missing, using defaults");
        Config::default()
    } else {
        anyhow::bail!("config file {} does not exist", cli.config.display());
    };

    let pool = tandem_sql::connect(&config.database.pool_options())
        .await
        .context("failed to connect to the database")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Bootstrap => bootstrap(&config, &pool).await,
        Command::Provider { action } => provider_admin(&config, &pool, action).await,
        Command::Route { action } => match action {
            RouteAction::Upsert { file } => admin::upsert_route(&pool, &file).await,
            RouteAction::Delete { name } => admin::delete_route(&pool, &name).await,
        },
        Command::Group { action } => match action {
            GroupAction::Upsert { file } => admin::upsert_group(&pool, &file).await,
            GroupAction::Refresh { name } => admin::refresh_group(&pool, &name).await.map(|_| ()),
            GroupAction::AddMember {
                group,
                provider,
                priority,
                weight,
            } => admin::add_group_member(&pool, &group, &provider, priority, weight).await,
            GroupAction::RemoveMember { group, provider } => {
                admin::remove_group_member(&pool, &group, &provider).await
            }
            GroupAction::Delete { name } => admin::delete_group(&pool, &name).await,
        },
        Command::Did { action } => match action {
            DidAction::Load { file, provider } => {
                admin::load_dids(&pool, &file, provider.as_deref())
                    .await
                    .map(|_| ())
            }
        },
        Command::Run => run(config, pool).await,
    }
}

async fn bootstrap(config: &Config, pool: &sqlx::PgPool) -> anyhow::Result<()> {
    tandem_sql::schema::bootstrap(pool)
        .await
        .context("schema bootstrap failed")?;

    let mut txn = pool.begin().await?;
    tandem_sql::switch_config::bootstrap_switch(
        &mut txn,
        &config.control_server.listen_address,
        config.control_server.port,
    )
    .await
    .context("switch bootstrap failed")?;
    txn.commit().await?;

    tracing::info!("bootstrap complete");
    Ok(())
}

async fn provider_admin(
    config: &Config,
    pool: &sqlx::PgPool,
    action: ProviderAction,
) -> anyhow::Result<()> {
    // Best effort: provisioning proceeds with the switch down and the
    // realtime rows are picked up on its next reload.
    let switch = ami::Client::new(config.switch_client.client_config());
    let switch = match switch
        .wait_connected(config.switch_client.connect_timeout)
        .await
    {
        Ok(()) => Some(switch),
        Err(_) => {
            tracing::warn!("switch unreachable, skipping reload");
            None
        }
    };
    let admin = provision::ProviderAdmin::new(pool.clone(), switch);

    match action {
        ProviderAction::Upsert { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let provider: models::Provider =
                serde_yaml::from_str(&raw).context("invalid provider definition")?;
            admin.upsert(&provider).await?;
            tracing::info!(provider = %provider.name, "provider upserted");
        }
        ProviderAction::Delete { name } => {
            admin.delete(&name).await?;
            tracing::info!(provider = %name, "provider deleted");
        }
    }
    Ok(())
}

async fn run(config: Config, pool: sqlx::PgPool) -> anyhow::Result<()> {
    tracing::info!(
        app = %config.app.name,
        environment = %config.app.environment,
        "starting router"
    );

    let shutdown = tokio_util::sync::CancellationToken::new();

    // Ctrl-C cancels the root token; every loop observes it.
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for CTRL-C");
        tracing::info!("received Ctrl+C, initiating shutdown");
        ctrl_c_token.cancel();
    });

    if config.monitoring.metrics_enabled {
        serve_metrics(config.monitoring.metrics_port).await?;
    }

    // Store liveness ping.
    let liveness = tandem_sql::Liveness::new();
    tokio::spawn(tandem_sql::ping_loop(
        pool.clone(),
        liveness.clone(),
        config.database.ping_interval,
        shutdown.child_token(),
    ));

    // Cache: redis when configured, in-process otherwise.
    let cache = if !config.cache.enabled {
        cache::Cache::disabled()
    } else if config.cache.url.is_empty() {
        cache::Cache::memory()
    } else {
        cache::Cache::redis(&config.cache.url)
            .await
            .context("failed to connect to the cache")?
    };
    let cache = Arc::new(cache);

    // Health tracking and its monitor loop, persisting snapshots.
    let tracker = Arc::new(balancer::HealthTracker::new());
    {
        let pool = pool.clone();
        let tracker = tracker.clone();
        let token = shutdown.child_token();
        let interval = config.monitoring.health_persist_interval;
        tokio::spawn(async move {
            balancer::monitor(tracker, interval, token, move |snapshots| {
                let pool = pool.clone();
                async move {
                    for snapshot in snapshots {
                        if let Err(err) = tandem_sql::health::upsert(&pool, &snapshot).await {
                            tracing::warn!(%err, provider = %snapshot.provider_name, "health persist failed");
                        }
                    }
                }
            })
            .await;
        });
    }

    // Switch client; its supervisor reconnects for the process lifetime.
    let switch = ami::Client::new(config.switch_client.client_config());
    switch.on_event("FullyBooted", |_| {
        tracing::info!("switch reports fully booted");
    });
    switch.on_event("Reload", |event| {
        tracing::info!(
            module = event.get("Module").unwrap_or(""),
            "switch configuration reloaded"
        );
    });

    // The call router and its stale sweeper.
    let call_router = Arc::new(router::CallRouter::new(
        pool.clone(),
        cache,
        tracker,
        config.router.router_config(),
    ));
    let restored = call_router.restore().await?;
    if restored > 0 {
        tracing::info!(restored, "restored open calls from the store");
    }
    tokio::spawn(call_router.clone().run_sweeper(shutdown.child_token()));

    // The control server is the foreground task.
    let server = fastagi::Server::new(call_router, config.control_server.server_config());
    let result = server.serve(shutdown.child_token()).await;

    switch.close().await;
    shutdown.cancel();
    result
}

async fn serve_metrics(port: u16) -> anyhow::Result<()> {
    use axum::routing::get;

    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let app = axum::Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind metrics port {port}"))?;
    tracing::info!(port, "metrics endpoint listening");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(%err, "metrics server failed");
        }
    });
    Ok(())
}
