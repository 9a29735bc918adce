//! Pipeline sinks.
//!
//! Most sinks are an [`EntityRouter`] over a [`ResourceFactory`]: CSV and SQL
//! file exports, database inserts and statement execution. The structure
//! sidecar has two single-output sinks of its own.

pub mod csv;
pub mod execute;
pub mod file;
pub mod insert;
pub mod router;
pub mod sql;
pub mod structure;

pub use self::csv::{CsvEntityWriter, CsvFileFactory};
pub use execute::{StatementFactory, StatementRunner};
pub use file::{FileLayout, OpenedFile};
pub use insert::{EntityInserter, InsertFactory};
pub use router::{EntityResource, EntityResourceMap, EntityRouter, ResourceFactory};
pub use sql::{SqlEntityWriter, SqlFileFactory};
pub use structure::{SchemaCacheSink, StructureFileSink};

/// Render rows as CSV text with the given quoting.
pub(crate) fn csv_text<I>(rows: I, style: ::csv::QuoteStyle) -> Result<String, ::csv::Error>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut writer = ::csv::WriterBuilder::new()
        .quote_style(style)
        .from_writer(Vec::new());
    for row in rows {
        writer.write_record(&row)?;
    }
    writer.flush()?;
    let bytes = writer
        .into_inner()
        .map_err(|e| ::csv::Error::from(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_text_quoting() {
        let rows = vec![vec!["a,b".to_string(), "c".to_string()]];
        assert_eq!(
            csv_text(rows.clone(), ::csv::QuoteStyle::Necessary).unwrap(),
            "\"a,b\",c\n"
        );
        assert_eq!(
            csv_text(rows, ::csv::QuoteStyle::Never).unwrap(),
            "a,b,c\n"
        );
    }
}
