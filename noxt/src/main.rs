//! CLI driver for the Nox scripting language.
//!
//! `noxt` with no arguments starts a REPL: each line is compiled and
//! run as its own top-level function against a `Runtime` that persists
//! across lines, so globals and classes defined on one line are
//! visible on the next. `noxt <file>` compiles and runs the file once.
//!
//! Exit codes mirror the reference interpreter: 0 on success, 65 on a
//! compile error, 70 on a runtime error.

mod config;
mod error;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use config::Config;
use error::NoxtError;
use nox_gc::Runtime;
use nox_vm::InterpretResult;

const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;

#[derive(Parser, Debug)]
#[command(name = "noxt", version, about = "Nox language REPL and script runner")]
struct Cli {
    /// Script to run. Starts a REPL if omitted.
    file: Option<PathBuf>,

    /// Print each instruction and the stack before executing it.
    #[arg(long)]
    trace: bool,

    /// Force a garbage collection on every allocation.
    #[arg(long = "gc-stress")]
    gc_stress: bool,

    /// Path to a noxt.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Raise logging verbosity. Can also be set via NOXT_VERBOSE.
    #[arg(short, long, global = true, env = "NOXT_VERBOSE")]
    verbose: bool,

    /// Disable ANSI color in log output.
    #[arg(long, env = "NOXT_NO_COLOR")]
    no_color: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("noxt: {err}");
            return ExitCode::from(EXIT_COMPILE_ERROR);
        }
    };

    init_logging(cli.verbose || config.verbose, cli.no_color || config.no_color);

    let mut runtime = Runtime::new();
    nox_vm::install_natives(&mut runtime);
    apply_gc_config(&mut runtime, &config, cli.gc_stress);

    let result = match &cli.file {
        Some(path) => run_file(&mut runtime, path, cli.trace),
        None => run_repl(&mut runtime, cli.trace),
    };

    match result {
        Ok(InterpretResult::Ok) => ExitCode::SUCCESS,
        Ok(InterpretResult::CompileError) => ExitCode::from(EXIT_COMPILE_ERROR),
        Ok(InterpretResult::RuntimeError) => ExitCode::from(EXIT_RUNTIME_ERROR),
        Err(err) => {
            eprintln!("noxt: {err}");
            ExitCode::from(EXIT_COMPILE_ERROR)
        }
    }
}

fn load_config(cli: &Cli) -> error::Result<Config> {
    match &cli.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
}

fn apply_gc_config(runtime: &mut Runtime, config: &Config, gc_stress_flag: bool) {
    runtime.heap.next_gc = config.gc.initial_heap_bytes;
    runtime.heap.growth_factor = config.gc.growth_factor;
    runtime.heap.stress_gc = gc_stress_flag || config.gc.stress;
}

fn init_logging(verbose: bool, no_color: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(!no_color)
        .with_target(false);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init();
}

fn run_file(runtime: &mut Runtime, path: &PathBuf, trace: bool) -> error::Result<InterpretResult> {
    let source = std::fs::read_to_string(path).map_err(|source| NoxtError::ReadSource {
        path: path.display().to_string(),
        source,
    })?;
    Ok(interpret(runtime, &source, trace))
}

fn run_repl(runtime: &mut Runtime, trace: bool) -> error::Result<InterpretResult> {
    let stdin = std::io::stdin();
    let mut last = InterpretResult::Ok;
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        let bytes_read = stdin.read_line(&mut line)?;
        if bytes_read == 0 {
            println!();
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        last = interpret(runtime, &line, trace);
    }
    Ok(last)
}

fn interpret(runtime: &mut Runtime, source: &str, trace: bool) -> InterpretResult {
    match nox_compiler::compile(source, runtime) {
        Ok(function) => nox_vm::run(runtime, function, trace),
        Err(diagnostics) => {
            for diagnostic in &diagnostics {
                eprintln!("{diagnostic}");
            }
            InterpretResult::CompileError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_file_argument() {
        let cli = Cli::parse_from(["noxt", "script.nox"]);
        assert_eq!(cli.file, Some(PathBuf::from("script.nox")));
        assert!(!cli.trace);
    }

    #[test]
    fn cli_parses_trace_and_gc_stress_flags() {
        let cli = Cli::parse_from(["noxt", "--trace", "--gc-stress", "script.nox"]);
        assert!(cli.trace);
        assert!(cli.gc_stress);
    }

    #[test]
    fn cli_with_no_file_starts_repl() {
        let cli = Cli::parse_from(["noxt"]);
        assert_eq!(cli.file, None);
    }

    #[test]
    fn interpret_reports_compile_error_for_bad_syntax() {
        let mut runtime = Runtime::new();
        nox_vm::install_natives(&mut runtime);
        let result = interpret(&mut runtime, "var = ;", false);
        assert_eq!(result, InterpretResult::CompileError);
    }

    #[test]
    fn interpret_runs_valid_source() {
        let mut runtime = Runtime::new();
        nox_vm::install_natives(&mut runtime);
        let result = interpret(&mut runtime, "print 1 + 2;", false);
        assert_eq!(result, InterpretResult::Ok);
    }

    #[test]
    fn globals_persist_across_interpret_calls() {
        let mut runtime = Runtime::new();
        nox_vm::install_natives(&mut runtime);
        assert_eq!(interpret(&mut runtime, "var x = 41;", false), InterpretResult::Ok);
        assert_eq!(interpret(&mut runtime, "print x + 1;", false), InterpretResult::Ok);
    }
}
