//! vitte-cli — the REPL and file driver built on top of `vitte-core`.
//!
//! This crate owns every bit of process-level concern `vitte-core` doesn't:
//! argument parsing, line editing, log setup, and the mapping from
//! `VitteError` to a process exit code. The VM itself never sees stdin,
//! stdout, or `std::process`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use vitte_core::{StdHost, Vm, VitteError, VmOptions};

/// `vitte [path] [--stress-gc] [--trace]`. No args starts the REPL; one
/// positional path runs that file; anything else is a usage error (exit 64).
#[derive(Parser, Debug)]
#[command(name = "vitte", about = "Vitte language REPL and script runner", version)]
struct Cli {
    /// Source file to run. Omit to start an interactive REPL.
    path: Option<PathBuf>,

    /// Run the collector before every allocation instead of only when the
    /// heap grows past its threshold. Slow; for GC bug-hunting only.
    #[arg(long)]
    stress_gc: bool,

    /// Print each compiled chunk's disassembly before running it.
    #[arg(long)]
    trace: bool,
}

/// Exit codes, matching the BSD `sysexits.h` convention the spec pins down:
/// 0 success, 64 usage error, 65 data (compile) error, 70 internal (runtime)
/// error, 74 I/O error.
mod exit {
    pub const OK: i32 = 0;
    pub const USAGE: i32 = 64;
    pub const DATA_ERR: i32 = 65;
    pub const SOFTWARE: i32 = 70;
    pub const IO_ERR: i32 = 74;
}

/// Parses arguments, wires up logging, and runs the REPL or a file. Returns
/// the process exit code; `main` is responsible for actually exiting.
pub fn run() -> i32 {
    init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{e}");
            return exit::OK;
        }
        Err(e) => {
            eprintln!("{e}");
            return exit::USAGE;
        }
    };

    let options = VmOptions::new().stress_gc(cli.stress_gc).trace_execution(cli.trace);
    let mut vm = Vm::new(options);
    vm.set_host(Box::new(StdHost));

    match cli.path {
        Some(path) => run_file(&mut vm, &path),
        None => run_repl(&mut vm),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn run_file(vm: &mut Vm, path: &Path) -> i32 {
    let source = match fs::read_to_string(path).with_context(|| format!("reading {}", path.display())) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("{err:#}");
            return exit::IO_ERR;
        }
    };

    report_outcome(vm.interpret(&source))
}

fn run_repl(vm: &mut Vm) -> i32 {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("failed to start line editor: {err}");
            return exit::SOFTWARE;
        }
    };
    let history = history_path();
    if let Some(path) = &history {
        let _ = editor.load_history(path);
    }

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                report_outcome(vm.interpret(&line));
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("{err}");
                break;
            }
        }
    }

    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
    exit::OK
}

fn history_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".vitte_history"))
}

/// Prints diagnostics/trace for a failed `interpret` call and returns the
/// matching exit code; a REPL iteration ignores the returned code and keeps
/// looping, a file run propagates it as the process's final code.
fn report_outcome(result: Result<vitte_core::InterpretOutcome, VitteError>) -> i32 {
    match result {
        Ok(_) => exit::OK,
        Err(VitteError::Compile(err)) => {
            for diagnostic in &err.diagnostics {
                eprintln!("{diagnostic}");
            }
            exit::DATA_ERR
        }
        Err(VitteError::Runtime(err)) => {
            eprintln!("{err}");
            for frame in &err.trace {
                eprintln!("{frame}");
            }
            exit::SOFTWARE
        }
    }
}
