//! Command-line interface for the dxb script compiler.
//!
//! Compiles DATEX script text, script files or JSON values into DATEX blocks
//! and prints them as hex, base64, raw bytes or JSON.
//!
//! ```rust,no_run
//! use clap::Parser;
//! use dxb_run::Cli;
//!
//! Cli::parse().run().expect("CLI execution failed");
//! ```
//!
//! # Command-line Examples
//!
//! Compile a script into a bare body:
//! ```bash
//! dxb --body-only '1 + 2'
//! ```
//!
//! Compile files into routed blocks for `@bob`:
//! ```bash
//! dxb -f --to @bob main.dx lib.dx
//! ```
pub mod cli;

pub use cli::Cli;
