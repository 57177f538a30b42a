use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One tabular data row: an ordered sequence of column values, immutable
/// once read.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SourceRow(Vec<String>);

impl SourceRow {
    pub fn new(cells: Vec<String>) -> Self {
        Self(cells)
    }

    /// Trimmed cell value; out-of-range columns read as empty.
    pub fn cell(&self, index: usize) -> &str {
        self.0.get(index).map(|c| c.trim()).unwrap_or("")
    }

    pub fn cells(&self) -> &[String] {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.iter().all(|c| c.trim().is_empty())
    }

    /// Pad or truncate to the header width. Header wins when the row is
    /// longer.
    fn resized(mut self, width: usize) -> Self {
        if self.0.len() > width {
            self.0.truncate(width);
        } else {
            while self.0.len() < width {
                self.0.push(String::new());
            }
        }
        self
    }
}

/// The normalized in-memory table produced by a tabular reader. Rows are
/// keyed by 0-based data-row index (headers excluded); parent row
/// indirection in the batch refers to these indices.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TabularBatch {
    pub headers: Vec<String>,
    pub rows: BTreeMap<usize, SourceRow>,
    pub total_rows: usize,
    /// Stable URL or handle of the source, when the backing reader has
    /// one. Its presence makes generated object UUIDs deterministic
    /// across re-reads of the same source and range.
    pub source_ref: Option<String>,
}

impl TabularBatch {
    pub fn new(headers: Vec<String>, source_ref: Option<String>) -> Self {
        let headers = headers
            .into_iter()
            .map(|h| h.trim().to_lowercase())
            .collect();
        Self {
            headers,
            rows: BTreeMap::new(),
            total_rows: 0,
            source_ref,
        }
    }

    /// Append a data row at the next index, sized to the header width.
    pub fn push_row(&mut self, row: SourceRow) {
        let row = row.resized(self.headers.len());
        self.rows.insert(self.total_rows, row);
        self.total_rows += 1;
    }

    pub fn header_index(&self, name: &str) -> Option<usize> {
        let name = name.trim().to_lowercase();
        self.headers.iter().position(|h| *h == name)
    }

    /// Header -> cell pairs for one row, in column order.
    pub fn record(&self, index: usize) -> Option<IndexMap<String, String>> {
        let row = self.rows.get(&index)?;
        Some(
            self.headers
                .iter()
                .enumerate()
                .map(|(i, h)| (h.clone(), row.cell(i).to_string()))
                .collect(),
        )
    }
}
