//! resh client binary entry point.
//!
//! SSH client with an escape console and a reconnectable UDP transport.

use clap::Parser;
use tracing::{debug, info};

use resh_client::{Cli, run};
use resh_core::{ExitCode, ProcessContext};

fn main() {
    let cli = Cli::parse();

    let log_format = cli.log_format.into();
    if let Err(e) = resh_core::logging::init_logging(cli.verbose, cli.log_file.as_deref(), log_format)
    {
        eprintln!("resh: failed to initialize logging: {}", e);
        std::process::exit(ExitCode::UserConfig.code());
    }
    info!(version = env!("CARGO_PKG_VERSION"), "resh starting");

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("resh: failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let ctx = ProcessContext::new();
    let outcome = rt.block_on(async {
        let outcome = run(&cli, &ctx).await;
        ctx.shutdown().await;
        outcome
    });
    // Background tasks may still hold stdin; do not wait for them.
    rt.shutdown_background();

    match outcome {
        Ok(code) => {
            debug!(code, "remote exited");
            std::process::exit(code);
        }
        Err(fatal) => {
            debug!(code = fatal.code.code(), error = %fatal.error, "fatal");
            eprint!("resh: {}\r\n", fatal);
            std::process::exit(fatal.code.code());
        }
    }
}
