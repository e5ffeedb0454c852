//! Delimited text export of an embedding.
//!
//! Each row becomes one line of comma-separated coordinates. When labels are
//! given, the row's label is appended as the last field. Labels are written
//! as supplied; the caller owns their meaning.

use crate::float::TsneFloat;
use ndarray::ArrayView2;
use std::fmt::Display;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while exporting an embedding.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExportError {
    /// Number of labels differs from the number of rows
    #[error("Expected {expected} labels, got {actual}")]
    LabelCount {
        /// Number of embedding rows
        expected: usize,
        /// Number of labels supplied
        actual: usize,
    },

    /// Writing failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Writes `embedding` to `writer`, one comma-delimited line per row.
///
/// # Errors
/// * `ExportError::LabelCount` if `labels` does not have one entry per row;
///   nothing is written in that case
/// * `ExportError::Io` if the writer fails
pub fn write_embedding<W, T, S>(
    writer: &mut W,
    embedding: ArrayView2<T>,
    labels: Option<&[S]>,
) -> Result<(), ExportError>
where
    W: Write,
    T: TsneFloat,
    S: Display,
{
    if let Some(labels) = labels {
        if labels.len() != embedding.nrows() {
            return Err(ExportError::LabelCount {
                expected: embedding.nrows(),
                actual: labels.len(),
            });
        }
    }

    for (i, row) in embedding.rows().into_iter().enumerate() {
        let mut fields = row.iter();
        if let Some(first) = fields.next() {
            write!(writer, "{first}")?;
        }
        for value in fields {
            write!(writer, ",{value}")?;
        }
        if let Some(label) = labels.and_then(|labels| labels.get(i)) {
            write!(writer, ",{label}")?;
        }
        writeln!(writer)?;
    }

    writer.flush()?;
    Ok(())
}

/// Writes `embedding` to the file at `path`, creating or truncating it.
///
/// # Errors
/// * `ExportError::LabelCount` if `labels` does not have one entry per row
/// * `ExportError::Io` if the file cannot be created or written
pub fn save_as_file<P, T, S>(
    path: P,
    embedding: ArrayView2<T>,
    labels: Option<&[S]>,
) -> Result<(), ExportError>
where
    P: AsRef<Path>,
    T: TsneFloat,
    S: Display,
{
    if let Some(labels) = labels {
        if labels.len() != embedding.nrows() {
            return Err(ExportError::LabelCount {
                expected: embedding.nrows(),
                actual: labels.len(),
            });
        }
    }

    let mut writer = BufWriter::new(File::create(path)?);
    write_embedding(&mut writer, embedding, labels)
}
