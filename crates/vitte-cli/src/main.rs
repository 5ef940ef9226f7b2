//! vitte-cli/src/main.rs — entry point for the `vitte` binary.
//!
//! Stays minimal: all argument parsing and exit-code logic lives in
//! `lib.rs`, which `cargo test -p vitte-cli` can exercise directly.

use std::process::ExitCode;

fn main() -> ExitCode {
    ExitCode::from(vitte_cli::run() as u8)
}
