use std::process::exit;

use clap::{Args, Parser, Subcommand};
use espcoredump::{
    cli::{dbg_corefile, info_corefile, ConnectArgs, CoreArgs},
    logging::initialize_logger,
};
use log::{debug, LevelFilter};
use miette::Result;

#[derive(Debug, Parser)]
#[command(about, version, propagate_version = true)]
struct Cli {
    #[command(flatten)]
    connect_args: ConnectArgs,

    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a GDB session on the core dump
    DbgCorefile(CoreArgs),
    /// Print a crash report extracted from the core dump
    InfoCorefile(InfoArgs),
}

#[derive(Debug, Args)]
struct InfoArgs {
    #[command(flatten)]
    core_args: CoreArgs,

    /// Print memory dump
    #[arg(short = 'm', long)]
    print_mem: bool,
}

fn main() {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    let Cli {
        connect_args,
        subcommand,
    } = Cli::parse();
    debug!("{subcommand:#?}");

    let result: Result<()> = match subcommand {
        Commands::DbgCorefile(args) => dbg_corefile(&connect_args, &args),
        Commands::InfoCorefile(args) => info_corefile(&connect_args, &args.core_args, args.print_mem),
    };

    // Fatal dump errors exit with code 2; usage errors keep clap's own
    // exit status.
    if let Err(report) = result {
        eprintln!("Error: {report:?}");
        exit(2);
    }
}
