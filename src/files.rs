use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A stored file the repository already knows about.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileRef {
    pub id: u64,
    pub uri: String,
}

/// Fetch-or-lookup capability for file tokens coming out of spreadsheet
/// cells. A token is a filename or URL; `archive` optionally scopes the
/// lookup to an archive uploaded with the set.
#[async_trait]
pub trait FileResolver: Send + Sync {
    async fn resolve(&self, token: &str, archive: Option<&str>) -> Result<Option<FileRef>>;
}

/// Shortest plausible filename: one character, a dot and a three letter
/// extension.
const MIN_FILE_CELL: usize = 5;

/// Split a file cell into its `;`-separated tokens. Cells too short to
/// name a file yield nothing, so stray punctuation never reaches the
/// resolver.
pub fn split_file_tokens(cell: &str) -> Vec<&str> {
    let cell = cell.trim();
    if cell.len() < MIN_FILE_CELL {
        return Vec::new();
    }
    cell.split(';')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect()
}
