//! CLI module for embedline
//!
//! Handles command-line argument parsing and human-readable output.

pub mod args;
pub mod output;

pub use args::{Args, Commands, Verbosity};
