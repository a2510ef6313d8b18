#![allow(clippy::missing_errors_doc)]
#![allow(missing_docs)]

mod check;
mod helpers;
mod run;

use anyhow::Result;
use clap::Parser;
use enum_dispatch::enum_dispatch;
use std::process::ExitCode;

#[derive(Parser)]
pub struct GlobalConfiguration {
    /// Number of parallel trajectory workers.
    #[arg(default_value_t = 1, long, short = 'j', value_name = "N")]
    pub workers: usize,
    /// Master seed; worker `rank` derives its RNG from `seed + rank`.
    #[arg(default_value_t = 1, long, value_name = "SEED")]
    pub seed: u64,
    /// Executed events between worker rendezvous points.
    #[arg(
        default_value_t = excimer::worker::DEFAULT_RENDEZVOUS_INTERVAL,
        long,
        value_name = "N"
    )]
    pub rendezvous: u64,
    /// Suppress progress output.
    #[arg(long)]
    pub quiet: bool,
}

#[enum_dispatch]
pub trait Subcommand {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode>;
}

#[enum_dispatch(Subcommand)]
#[derive(Parser)]
pub enum SubcommandEnum {
    Check(check::Opts),
    Run(run::Opts),
}

#[derive(Parser)]
#[command(
    arg_required_else_help = true,
    author,
    about,
    disable_help_subcommand = true,
    name = "excimer",
    version
)]
pub struct Opts {
    #[command(flatten)]
    pub configuration: GlobalConfiguration,
    #[command(subcommand)]
    pub subcommand: SubcommandEnum,
}
