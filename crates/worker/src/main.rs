use anyhow::Context;
use tokio_util::sync::CancellationToken;

use parley_infra::WorkerConfig;
use parley_worker::ProcessSettings;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    parley_observability::init();

    let settings = ProcessSettings::from_env().context("invalid process settings")?;
    let config = WorkerConfig::from_env().context("invalid worker configuration")?;

    let cancel = CancellationToken::new();
    tokio::spawn(parley_worker::cancel_on_shutdown_signal(cancel.clone()));

    tracing::info!(
        mode = %settings.mode,
        worker_id = %config.worker_id,
        max_concurrent = config.max_concurrent,
        "starting parley worker"
    );

    parley_worker::run(settings, config, cancel).await
}
