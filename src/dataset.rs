use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::StringRecord;
use tracing::{debug, info, warn};

use crate::{AppError, AppResult};

/// One row of the input table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub text: String,
    /// `None` when the label cell is empty; such rows are still embedded and
    /// clustered but do not count as a label value.
    pub label: Option<String>,
}

/// Documents in file order.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub documents: Vec<Document>,
}

impl Dataset {
    #[tracing::instrument(name = "Loading dataset", level = "info", skip(text_column, label_column))]
    pub fn from_path<P: AsRef<Path> + std::fmt::Debug>(
        path: P,
        text_column: &str,
        label_column: &str,
    ) -> AppResult<Self> {
        let file = File::open(path.as_ref())?;
        let source = path.as_ref().display().to_string();
        let dataset = Self::from_reader(file, &source, text_column, label_column)?;
        if dataset.is_empty() {
            warn!("{} has a header but no documents", source);
        }
        info!(
            "Loaded {} documents with {} distinct labels",
            dataset.len(),
            dataset.distinct_labels()
        );
        Ok(dataset)
    }

    /// Read a headed CSV table. Rows with a different field count than the
    /// header are rejected.
    pub fn from_reader<R: Read>(
        reader: R,
        source: &str,
        text_column: &str,
        label_column: &str,
    ) -> AppResult<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(reader);
        let headers = rdr.headers()?.clone();
        let text_idx = column_index(&headers, text_column, source)?;
        let label_idx = column_index(&headers, label_column, source)?;
        debug!(
            "Text column `{}` at {}, label column `{}` at {}",
            text_column, text_idx, label_column, label_idx
        );

        let mut documents = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let text = record.get(text_idx).unwrap_or_default().to_string();
            let label = record
                .get(label_idx)
                .filter(|label| !label.is_empty())
                .map(str::to_string);
            documents.push(Document { text, label });
        }
        Ok(Self { documents })
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn texts(&self) -> Vec<String> {
        self.documents.iter().map(|doc| doc.text.clone()).collect()
    }

    /// Number of distinct non-empty label values. This is the cluster count.
    pub fn distinct_labels(&self) -> usize {
        self.documents
            .iter()
            .filter_map(|doc| doc.label.as_deref())
            .collect::<HashSet<&str>>()
            .len()
    }
}

fn column_index(headers: &StringRecord, column: &str, source: &str) -> AppResult<usize> {
    headers
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| AppError::MissingColumn {
            column: column.to_string(),
            path: source.to_string(),
            available: headers.iter().collect::<Vec<_>>().join(", "),
        })
}
