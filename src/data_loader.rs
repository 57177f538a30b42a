use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::batch::{SourceRow, TabularBatch};

/// Produces normalized tabular batches. The core only depends on this
/// shape; the backing format is the reader's business.
pub trait TabularSource {
    /// Read up to `limit` data rows starting at `offset` (0-based, headers
    /// excluded). `None` reads everything.
    fn read(&self, limit: Option<usize>, offset: usize) -> Result<TabularBatch>;
}

/// Delimited-text reader. Headers are lower-cased and trimmed, every data
/// row is sized to the header width, and reading stops at the first
/// entirely blank row.
pub struct CsvSource {
    path: PathBuf,
    delimiter: u8,
    source_ref: Option<String>,
}

impl CsvSource {
    pub fn csv(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: b',',
            source_ref: None,
        }
    }

    pub fn tsv(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: b'\t',
            source_ref: None,
        }
    }

    /// Pick the delimiter from the file extension.
    pub fn for_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match path.extension().and_then(std::ffi::OsStr::to_str) {
            Some("csv") => Ok(Self::csv(path)),
            Some("tsv") => Ok(Self::tsv(path)),
            other => anyhow::bail!("unsupported extension {:?}", other.unwrap_or("")),
        }
    }

    /// Attach a stable source reference so generated UUIDs become
    /// deterministic for this source and range.
    pub fn with_source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }
}

impl TabularSource for CsvSource {
    fn read(&self, limit: Option<usize>, offset: usize) -> Result<TabularBatch> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_path(&self.path)
            .with_context(|| format!("could not open {}", self.path.display()))?;

        let mut records = reader.records();
        let headers: Vec<String> = match records.next() {
            Some(first) => first?.iter().map(|h| h.to_string()).collect(),
            None => Vec::new(),
        };
        let mut batch = TabularBatch::new(headers, self.source_ref.clone());

        let mut seen = 0usize;
        for record in records {
            let record = record?;
            let row = SourceRow::new(record.iter().map(|c| c.to_string()).collect());
            if row.is_blank() {
                break;
            }
            if seen >= offset {
                batch.push_row(row);
                if let Some(limit) = limit {
                    if batch.total_rows >= limit {
                        break;
                    }
                }
            }
            seen += 1;
        }

        debug!(
            "read {} row(s) from {}",
            batch.total_rows,
            self.path.display()
        );
        Ok(batch)
    }
}

/// Write a batch back out as CSV, headers first.
pub fn csv_save(batch: &TabularBatch, path: impl AsRef<Path>) -> Result<()> {
    let mut writer = csv::Writer::from_path(path.as_ref())?;
    writer.write_record(&batch.headers)?;
    for row in batch.rows.values() {
        writer.write_record(row.cells())?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn reads_headers_and_rows() {
        let file = fixture("Label,TYPE,parent\nFirst,Book,\nSecond,Page,0\n");
        let batch = CsvSource::csv(file.path()).read(None, 0).unwrap();

        assert_eq!(batch.headers, vec!["label", "type", "parent"]);
        assert_eq!(batch.total_rows, 2);
        assert_eq!(batch.rows[&1].cell(1), "Page");
        assert_eq!(batch.rows[&1].cell(2), "0");
    }

    #[test]
    fn stops_at_first_blank_row() {
        let file = fixture("label,type\na,Book\n,\nb,Book\n");
        let batch = CsvSource::csv(file.path()).read(None, 0).unwrap();
        assert_eq!(batch.total_rows, 1);
    }

    #[test]
    fn honors_limit_and_offset() {
        let file = fixture("label,type\na,Book\nb,Book\nc,Book\n");
        let batch = CsvSource::csv(file.path()).read(Some(1), 1).unwrap();
        assert_eq!(batch.total_rows, 1);
        assert_eq!(batch.rows[&0].cell(0), "b");
    }

    #[test]
    fn rejects_unknown_extension() {
        assert!(CsvSource::for_path("rows.xlsx").is_err());
    }

    #[test]
    fn csv_roundtrip() {
        let file = fixture("label,type\na,Book\n");
        let batch = CsvSource::csv(file.path())
            .with_source_ref("file://rows.csv")
            .read(None, 0)
            .unwrap();

        let out = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        csv_save(&batch, out.path()).unwrap();
        let again = CsvSource::csv(out.path()).read(None, 0).unwrap();
        assert_eq!(again.headers, batch.headers);
        assert_eq!(again.rows[&0], batch.rows[&0]);
    }
}
