//! The `approve` subcommand: dials the Control Surface and approves a
//! queued first-time pairing by its key id.

use anyhow::Result;

use rootbridge_core::config::load_config;
use rootbridge_core::control::{send_command, ControlCommand, ControlResponse};

pub(crate) async fn command(cli: &crate::Cli, kid: &str) -> Result<()> {
    let config = load_config(&cli.config)?;
    let response = send_command(
        &config.control_socket,
        ControlCommand::Approve { kid: kid.to_owned() },
    )
    .await?;

    match response {
        ControlResponse::Ok => println!("approved {kid}"),
        ControlResponse::Error { message } => println!("error: {message}"),
        ControlResponse::Status { .. } => {}
    }
    Ok(())
}
