//! Statement files: one statement per line.

use snafu::prelude::*;
use std::io::{BufRead, BufReader, Lines, Read};
use std::path::PathBuf;

use crate::error::{ReadInputSnafu, StageError};
use crate::model::{EntityDescriptor, SqlLine};
use crate::pipeline::{RecordStream, RunContext, Source};

use super::files::{display_name, list_data_files, open_text};

/// Reads `.sql` files of the run directory.
///
/// Every file is its own entity, so the statement sink runs one file per
/// resource. Blank lines are skipped and a trailing `;` is removed.
pub struct SqlFileSource;

impl Source for SqlFileSource {
    type Unit = PathBuf;
    type Output = SqlLine;

    fn name(&self) -> &'static str {
        "sql_file"
    }

    fn enumerate(&self, ctx: &RunContext) -> Result<Vec<PathBuf>, StageError> {
        list_data_files(ctx)
    }

    fn transform(&self, path: PathBuf, ctx: &RunContext) -> Result<RecordStream<SqlLine>, StageError> {
        let reader = open_text(&path, None, ctx)?;
        Ok(Box::new(SqlLines {
            lines: BufReader::new(reader).lines(),
            entity: EntityDescriptor::new(display_name(&path), false),
            truncated: false,
            done: false,
        }))
    }
}

struct SqlLines {
    lines: Lines<BufReader<Box<dyn Read + Send>>>,
    entity: EntityDescriptor,
    truncated: bool,
    done: bool,
}

impl Iterator for SqlLines {
    type Item = Result<SqlLine, StageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let next = if self.truncated { None } else { self.lines.next() };
            match next {
                Some(Ok(line)) => {
                    let statement = line.trim().trim_end_matches(';').trim_end();
                    if statement.is_empty() {
                        continue;
                    }
                    return Some(Ok(SqlLine {
                        entity: self.entity.clone(),
                        statement: statement.to_string(),
                    }));
                }
                Some(Err(e)) => {
                    // Nothing past a read error is trustworthy; close the entity next.
                    self.truncated = true;
                    return Some(Err(e).context(ReadInputSnafu {
                        path: self.entity.name(),
                    }));
                }
                None => {
                    self.done = true;
                    return Some(Ok(SqlLine::end_of_entity(&self.entity)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileFormat;
    use crate::pipeline::context::test_support::context;

    #[test]
    fn test_lines_are_trimmed_and_closed_with_marker() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dump.sql");
        std::fs::write(
            &path,
            "INSERT INTO root.d1(timestamp,s1) VALUES (1,1);\n\n  INSERT INTO root.d1(timestamp,s1) VALUES (2,2)\n",
        )
        .unwrap();
        let ctx = context(dir.path(), FileFormat::Sql);

        let items: Vec<SqlLine> = SqlFileSource
            .transform(path, &ctx)
            .unwrap()
            .map(Result::unwrap)
            .collect();

        assert_eq!(items.len(), 3);
        assert_eq!(
            items[0].statement,
            "INSERT INTO root.d1(timestamp,s1) VALUES (1,1)"
        );
        assert_eq!(items[1].entity.name(), "dump.sql");
        assert!(items[2].entity.is_end_marker());
    }
}
