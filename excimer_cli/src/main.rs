#![allow(missing_docs)]

use clap::Parser;
use excimer_cli::{Opts, Subcommand};
use std::process::{ExitCode, Termination};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let opts = Opts::parse();

    if !opts.configuration.quiet {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    match opts.subcommand.run(&opts.configuration) {
        Ok(code) => code,
        result @ Err(_) => result.report(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_command() {
        use clap::CommandFactory;
        Opts::command().debug_assert();
    }
}
