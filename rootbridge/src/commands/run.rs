//! The `run` subcommand: loads configuration, starts the daemon, and blocks
//! until Ctrl-C or the front door exits. Uses systemd readiness
//! notification, an attended-terminal banner, and a `ctrl_c`/server-future
//! race.

use anyhow::Result;
use tracing::*;

use rootbridge_core::config::load_config;
use rootbridge_core::Daemon;

pub(crate) async fn command(cli: &crate::Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    crate::logging::init(cli, config.log.format)?;

    let version = env!("CARGO_PKG_VERSION");
    info!(%version, "rootbridge");

    let daemon = Daemon::new(config).await?;

    #[cfg(target_os = "linux")]
    if let Ok(true) = sd_notify::booted() {
        use sd_notify::NotifyState;
        tokio::spawn(async {
            if let Err(error) = async {
                sd_notify::notify(false, &[NotifyState::Ready])?;
                loop {
                    sd_notify::notify(false, &[NotifyState::Watchdog])?;
                    tokio::time::sleep(std::time::Duration::from_secs(15)).await;
                }
                #[allow(unreachable_code)]
                Ok::<(), anyhow::Error>(())
            }
            .await
            {
                error!(?error, "failed to communicate with systemd");
            }
        });
    }

    if console::user_attended() {
        info!("--------------------------------------------");
        info!("rootbridge is now running.");
        info!("--------------------------------------------");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, exiting");
            std::process::exit(0);
        }
        result = daemon.start() => {
            if let Err(error) = result {
                error!(?error, "daemon exited with an error");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
