//! Client CLI implementation.
//!
//! Provides command-line argument parsing using clap.

mod parsing;
mod types;


pub use parsing::parse_stdio_forward;
pub use types::*;
