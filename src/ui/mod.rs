//! Command-line user interface

mod cli;

pub use cli::*;
