use anyhow::Result;
use clap::Parser;

use aql_cli::cli::{Cli, Commands};
use aql_cli::output::print_error;
use aql_cli::{commands, config, observability};

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        print_error(&format!("{e:#}"));
        std::process::exit(commands::exit_code(&e));
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut cfg = config::load_config(cli.config.as_deref())?;
    if cli.verbose {
        cfg.logging.level = "debug".to_string();
    }
    observability::init_tracing_with_level(&cfg.logging.level);

    match &cli.command {
        Commands::Compile(args) => commands::compile::run(&cfg, args, cli.verbose),
        Commands::Parse(args) => commands::parse::run(args),
    }
}
