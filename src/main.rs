// sandboxd - lifecycle manager for cloud-hosted development sandboxes

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use sandboxd::clock::SystemClock;
use sandboxd::config::AppConfig;
use sandboxd::controller::LifecycleController;
use sandboxd::gateway::{AccessBroker, HttpBroker};
use sandboxd::notify::{Dispatcher, LogSink, NotificationSink};
use sandboxd::policy::IdlePolicy;
use sandboxd::provider::OpenStackProvider;
use sandboxd::reconciler::Reconciler;
use sandboxd::store::VmStore;

#[derive(Parser, Debug)]
#[command(name = "sandboxd", about = "Sandbox VM lifecycle manager")]
struct Args {
    /// Override the data directory (SANDBOXD_DATA_DIR otherwise).
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Run one policy and reconciliation sweep, then exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = AppConfig::load()?;
    if let Some(data_dir) = args.data_dir {
        config.store.data_dir = data_dir;
    }

    let store = Arc::new(VmStore::open(&config.store.data_dir)?);
    let recovered = store.recover()?;
    tracing::info!(recovered, data_dir = %config.store.data_dir.display(), "state store ready");

    let provider = Arc::new(OpenStackProvider::new(&config.provider)?);
    let broker: Option<Arc<dyn AccessBroker>> = match &config.broker {
        Some(broker_config) => {
            Some(Arc::new(HttpBroker::new(broker_config)?) as Arc<dyn AccessBroker>)
        }
        None => {
            tracing::info!("no remote-access broker configured");
            None
        }
    };
    let notifier: Arc<dyn NotificationSink> =
        Arc::new(Dispatcher::new().with_sink(Arc::new(LogSink)));
    let clock = Arc::new(SystemClock);

    let controller = Arc::new(LifecycleController::new(
        Arc::clone(&store),
        provider,
        broker,
        Arc::clone(&notifier),
        clock.clone(),
        config.lifecycle.clone(),
    ));

    let reconciler = Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&controller),
        clock.clone(),
        config.lifecycle.clone(),
    );
    let policy = IdlePolicy::new(
        Arc::clone(&store),
        Arc::clone(&controller),
        notifier,
        clock,
        config.lifecycle.clone(),
    );

    if args.once {
        let reconciled = reconciler.sweep().await;
        let policed = policy.sweep().await;
        tracing::info!(?reconciled, ?policed, "single sweep completed");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let reconciler_task = tokio::spawn(reconciler.run(shutdown.clone()));
    let policy_task = tokio::spawn(policy.run(shutdown.clone()));
    tracing::info!("sandboxd running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    shutdown.cancel();
    let _ = reconciler_task.await;
    let _ = policy_task.await;

    Ok(())
}
