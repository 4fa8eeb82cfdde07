//! Table formatting utilities for structured output.

use comfy_table::{
    Attribute, Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
};

use crate::pipeline::BuildReport;
use crate::vector::{SimilarityResult, SubredditFit};

/// Builder for creating formatted tables.
pub struct TableBuilder {
    table: Table,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    /// Create a new table builder.
    pub fn new() -> Self {
        Self {
            table: styled_table(),
        }
    }

    /// Set the table headers.
    pub fn set_headers(mut self, headers: Vec<&str>) -> Self {
        self.table.set_header(bold_cells(headers));
        self
    }

    /// Add a row to the table.
    pub fn add_row(mut self, row: Vec<String>) -> Self {
        self.table.add_row(row);
        self
    }

    /// Build and return the formatted table.
    pub fn build(self) -> String {
        self.table.to_string()
    }
}

fn styled_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.apply_modifier(UTF8_ROUND_CORNERS);
    table
}

fn bold_cells(headers: Vec<&str>) -> Vec<Cell> {
    headers
        .into_iter()
        .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
        .collect()
}

/// One row per published index, plus a row per subreddit that failed.
pub fn create_build_summary_table(reports: &[BuildReport], failures: &[(String, String)]) -> String {
    let mut table = styled_table();
    table.set_header(bold_cells(vec!["Subreddit", "Posts", "Lists", "Status"]));

    for report in reports {
        table.add_row(vec![
            Cell::new(&report.subreddit),
            Cell::new(report.documents),
            Cell::new(report.nlist),
            Cell::new("published").fg(Color::Green),
        ]);
    }
    for (subreddit, error) in failures {
        table.add_row(vec![
            Cell::new(subreddit),
            Cell::new("-"),
            Cell::new("-"),
            Cell::new(error).fg(Color::Red),
        ]);
    }

    table.to_string()
}

/// Nearest neighbors of one query, closest first.
pub fn create_neighbor_table(result: &SimilarityResult) -> String {
    let mut table = styled_table();
    table.set_header(bold_cells(vec!["#", "Document", "Distance", "Similarity"]));

    for (rank, neighbor) in result.neighbors.iter().enumerate() {
        table.add_row(vec![
            (rank + 1).to_string(),
            neighbor.document_id.clone(),
            format!("{:.4}", neighbor.distance),
            format!("{:.4}", neighbor.similarity),
        ]);
    }

    table.to_string()
}

/// Subreddits ranked by fit; failures listed last with their status code.
pub fn create_fit_table(fits: &[SubredditFit]) -> String {
    let mut table = styled_table();
    table.set_header(bold_cells(vec![
        "Subreddit",
        "Score",
        "Neighbors",
        "Min distance",
    ]));

    for fit in fits {
        match &fit.result {
            Ok(result) => table.add_row(vec![
                Cell::new(&fit.subreddit),
                Cell::new(format!("{:.4}", result.similarity_score)).add_attribute(Attribute::Bold),
                Cell::new(result.neighbors.len()),
                Cell::new(format!("{:.4}", result.min_distance)),
            ]),
            Err(e) => table.add_row(vec![
                Cell::new(&fit.subreddit),
                Cell::new(e.status_code()).fg(Color::Yellow),
                Cell::new("-"),
                Cell::new("-"),
            ]),
        };
    }

    table.to_string()
}
