use optic_agent::{Agent, Config};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

fn init_tracing() -> eyre::Result<()> {
    let debug = std::env::var("OPTIC_DEBUG").map(|v| v == "1").unwrap_or(false);
    let default_level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let filter = EnvFilter::builder()
        .with_env_var("OPTIC_LOG")
        .with_default_directive(default_level.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    init_tracing()?;

    let mut restarts: u32 = 0;
    loop {
        let config = Config::load()?;
        tracing::info!(
            device_id = config.device_id(),
            environment = config.environment(),
            "starting optic agent"
        );

        match Agent::bootstrap(config.clone()).await {
            Ok(mut agent) => {
                agent.start();
                tokio::signal::ctrl_c().await?;
                tracing::info!("shutdown signal received");
                agent.stop().await;
                break;
            }
            Err(e) => {
                restarts += 1;
                tracing::error!(error = %e, restarts, "initialization failed");
                if restarts >= config.max_restart_attempts() {
                    tracing::error!("max restart attempts reached, exiting");
                    std::process::exit(1);
                }
                tokio::time::sleep(config.restart_delay()).await;
            }
        }
    }

    Ok(())
}
