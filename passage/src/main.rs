mod cli;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use passage_common::{types::exit_code, PassageError};
use passage_core::Services;
use passage_ssh::{install_forwards, login, run_session};
use tracing::*;

use crate::cli::Cli;
use crate::logging::init_logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(error) = init_logging(&cli) {
        eprintln!("passage: {error:#}");
        std::process::exit(exit_code::FORCED_EXIT);
    }

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            error!("{error}");
            std::process::exit(error.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<i32, PassageError> {
    let mode = cli
        .session_mode()
        .map_err(PassageError::Config)?;
    let args = cli.to_ssh_args();

    let services = Services::load(args.config_file.clone().map(PathBuf::from), &args.options);
    services.lifecycle.install_signal_handler()?;

    let connection = Arc::new(login(&services, &args).await?);
    // forwarders attach before the session starts
    install_forwards(&connection, &args).await?;

    let code = run_session(&connection, &args, mode).await?;

    connection.disconnect().await;
    services.lifecycle.run_close();
    debug!(code, "session finished");
    Ok(code)
}
