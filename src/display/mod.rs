//! Terminal output for the CLI: progress bars while embedding posts and
//! tables for build, query and fit results.

pub mod progress;
pub mod tables;

pub use progress::{create_progress_bar, create_spinner};
pub use tables::{
    TableBuilder, create_build_summary_table, create_fit_table, create_neighbor_table,
};
