//! Command-line entry point
//!
//! Loads a program file, runs it to a fixed point, and optionally drops
//! into the interactive shell. Exit code 0 on normal completion; non-zero
//! only for unrecoverable errors (I/O, fatal parse, duplicate rule names).

#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser};

use retort::engine::Reasoner;
use retort::{resolve, shell};

/// Forward-chaining production-rule reasoner with truth maintenance and
/// fuzzy inference.
#[derive(Parser)]
#[clap(name = "retort", version)]
struct Args {
    /// Program file to load and run
    #[clap(short = 'f', long = "file", value_name = "FILE")]
    file: Option<PathBuf>,

    /// Conflict-resolution strategy (case-insensitive prefix of
    /// first-match or stratified-manual)
    #[clap(short = 's', long = "strategy", value_name = "NAME", default_value = "first-match")]
    strategy: String,

    /// Enable schema validation from the start
    #[clap(short = 'c', long = "schema-check")]
    schema_check: bool,

    /// Drop into the interactive shell after loading
    #[clap(short = 'i', long = "interactive")]
    interactive: bool,

    /// Verbose cycle tracing
    #[clap(short = 't', long = "trace")]
    trace: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.trace { "retort=trace" } else { "retort=info" };
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()))
        .with_target(false)
        .compact()
        .init();

    let Some(file) = args.file else {
        Args::command().print_long_help()?;
        println!();
        return Ok(());
    };

    let text = fs::read_to_string(&file)
        .with_context(|| format!("read program file {}", file.display()))?;

    let mut reasoner = Reasoner::new(resolve::choose(&args.strategy), args.schema_check);
    reasoner
        .load(&text)
        .with_context(|| format!("load {}", file.display()))?;

    if args.interactive {
        shell::repl(&mut reasoner);
    }
    Ok(())
}
