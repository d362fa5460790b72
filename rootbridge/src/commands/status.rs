//! The `status` subcommand: dials the Control Surface and prints the
//! running daemon's tunnel URL, session count, and last-paired fingerprint.

use anyhow::Result;

use rootbridge_core::config::load_config;
use rootbridge_core::control::{send_command, ControlCommand, ControlResponse};

pub(crate) async fn command(cli: &crate::Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    let response = send_command(&config.control_socket, ControlCommand::Status).await?;

    match response {
        ControlResponse::Status {
            tunnel_url,
            active_sessions,
            last_fingerprint,
        } => {
            println!(
                "tunnel url: {}",
                tunnel_url.as_deref().unwrap_or("(not yet announced)")
            );
            println!("active sessions: {active_sessions}");
            println!(
                "last fingerprint: {}",
                last_fingerprint.as_deref().unwrap_or("(none)")
            );
        }
        ControlResponse::Error { message } => println!("error: {message}"),
        ControlResponse::Ok => {}
    }
    Ok(())
}
