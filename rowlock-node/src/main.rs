use std::sync::Arc;

use anyhow::{Context, Result};
use rowlock_core::LockConfig;
use tracing::info;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

mod election;
mod settings;

use election::Control;
use settings::NodeSettings;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = NodeSettings::load().context("failed to load node settings")?;
    init_tracing(&settings);
    let config = LockConfig::load().context("failed to load lock configuration")?;
    info!("lock config:\n{:?}", config);
    info!("node settings:\n{:?}", settings);

    let control = Arc::new(Control::default());

    let election_control = control.clone();
    let mut election = tokio::task::spawn_blocking(move || {
        election::run(config, &settings, &election_control);
    });

    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .context("failed to install CTRL+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        let mut signal =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        signal.recv().await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("received SIGINT, releasing the lock");
        }
        result = terminate => {
            result?;
            info!("received SIGTERM, releasing the lock");
        }
        result = &mut election => {
            result.context("election loop panicked")?;
            info!("election loop stopped");
            return Ok(());
        }
    }

    control.request_shutdown();
    election.await.context("election loop panicked")?;

    info!("node shutdown complete");
    Ok(())
}

fn init_tracing(settings: &NodeSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rowlock_core=debug"));

    if settings.json_logs() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
            .init();
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
            .init();
    }
}
