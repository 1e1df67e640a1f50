use anyhow::{Context, Result, anyhow};
use broker_client::Connection;
use tokio::{runtime::Builder, signal};
use tokio_util::sync::CancellationToken;
use tracing::*;

mod config;
mod roles;

use config::{
    cli::{self, Parser},
    trace,
};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // load .env first so its values can feed the env fallbacks below
    let dotenv = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.demo_log, config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => {
                error!(?err, "demo task failed");
                Err(anyhow!(err))
            }
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                Err(err)
            }
            Ok(Ok(())) => {
                debug!("exiting...");
                Ok(())
            }
        }
    })
}

async fn start(config: cli::Config) -> Result<()> {
    info!(role = ?config.role, nats = %config.nats, "starting demo");
    let conn = Connection::connect(config.nats.clone(), config.connection_options())
        .await
        .with_context(|| format!("failed to connect to {}", config.nats))?;

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    if let Err(err) = roles::run(&conn, &config, token).await {
        // no point draining after a failed role
        conn.close().await;
        return Err(err);
    }

    if let Err(err) = conn.drain().await {
        warn!(?err, "drain failed");
    }
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(?err, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ret = tokio::select! {
        res = signal::ctrl_c() => res.map_err(|err| anyhow!(err)),
        _ = terminate => Ok(()),
    };
    info!("shutdown signal received");
    token.cancel();
    ret
}
