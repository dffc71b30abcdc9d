mod ast;
mod codegen;
mod engine;
mod error;
mod ir;
mod lexer;
mod parser;
mod passes;
mod precedence;
mod scope;
mod token;
mod toplevel;
mod verify;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kaleidoscope")]
#[command(about = "An interactive compiler for the Kaleidoscope language")]
struct Args {
    /// Source file to compile and run; reads stdin interactively when absent
    file: Option<PathBuf>,

    /// Print the IR of every lowered function
    #[arg(long)]
    dump_ir: bool,

    /// Skip the per-function optimization passes
    #[arg(long)]
    no_opt: bool,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = toplevel::Config {
        dump_ir: args.dump_ir,
        optimize: !args.no_opt,
        ..toplevel::Config::default()
    };
    tracing::info!(optimize = config.optimize, "starting kaleidoscope");

    let result = match &args.file {
        Some(path) => toplevel::run_file(config, path),
        None => toplevel::main_loop(config),
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
