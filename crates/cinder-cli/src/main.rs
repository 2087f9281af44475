//! Cinder command-line driver
//!
//! With no script argument, runs an interactive session; with one, compiles
//! and executes the file. Exit codes follow sysexits: 64 usage, 65 compile
//! error, 70 runtime error, 74 I/O error.

mod commands;

use cinder_runtime::VmOptions;
use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "cinder", version, about = "The Cinder scripting language")]
struct Cli {
    /// Script to run; omit for an interactive session
    script: Option<PathBuf>,

    /// Print the compiled bytecode instead of executing
    #[arg(long)]
    disasm: bool,

    /// Log each instruction with the stack before it
    /// (visible with RUST_LOG=cinder::vm=trace)
    #[arg(long)]
    trace: bool,

    /// Collect garbage before every allocation
    #[arg(long)]
    gc_stress: bool,

    /// Emit diagnostics as JSON
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) =>
        {
            err.exit()
        }
        Err(err) => {
            let _ = err.print();
            process::exit(commands::EX_USAGE);
        }
    };

    init_tracing();

    let options = VmOptions {
        trace_execution: cli.trace,
        print_code: cli.disasm,
        gc_stress: cli.gc_stress,
        gc_threshold: None,
    };

    let code = match cli.script {
        Some(path) => commands::run::run_file(&path, options, cli.disasm, cli.json),
        None => commands::repl::run(options, cli.json),
    };
    process::exit(code);
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}
