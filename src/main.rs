use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use db_event_consumer::{
    datasource::DatasourceRegistry, health, logging, model, settings::Settings,
    sink::kafka::KafkaClaim, supervisor,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[doc(hidden)]
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// main config; sinker files are read from its directory
    #[arg(short, long, default_value = "config/config.yaml")]
    config: PathBuf,

    #[arg(short, long, default_value = "datasource.yaml")]
    datasource: PathBuf,
}

async fn shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                error!("cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown requested");
    token.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::new(&args.config, &args.datasource)
        .with_context(|| format!("cannot load config {}", args.config.display()))?;
    logging::init(&settings.log)?;

    let models = Arc::new(model::builtin().context("registering models")?);
    let mut datasources = DatasourceRegistry::with_mysql_factories();
    for ds in settings.datasources {
        datasources
            .register(ds)
            .context("registering datasources")?;
    }
    let datasources = Arc::new(datasources);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let listener = TcpListener::bind(settings.health.listen)
        .await
        .with_context(|| format!("cannot bind health endpoint {}", settings.health.listen))?;
    let health = tokio::spawn(health::serve_on(listener, shutdown.clone()));

    let kafka = settings.kafka_info;
    supervisor::run(settings.sinkers, models, datasources, shutdown.clone(), |binding| {
        KafkaClaim::subscribe(&kafka, binding)
    })
    .await;

    // no sinker left running, nothing to stay up for
    shutdown.cancel();
    if let Err(e) = health.await? {
        error!("health endpoint: {e}");
    }
    Ok(())
}
