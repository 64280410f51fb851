//! Command-line interface for sentiment-forge.
//!
//! Provides the `run` command for a full scoring pass and `fetch` for
//! exporting the stored comments.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
