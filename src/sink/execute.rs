//! Statement-file import: each line runs as-is.

use std::sync::Arc;
use tracing::warn;

use crate::emit;
use crate::error::SinkError;
use crate::metrics::events::RecordDropped;
use crate::model::{EntityDescriptor, SqlLine};
use crate::pipeline::RunContext;
use crate::session::Session;

use super::router::{EntityResource, ResourceFactory};

pub struct StatementFactory;

impl ResourceFactory for StatementFactory {
    type Item = SqlLine;
    type Resource = StatementRunner;

    fn open(
        &mut self,
        entity: &EntityDescriptor,
        ctx: &RunContext,
    ) -> Result<StatementRunner, SinkError> {
        Ok(StatementRunner {
            entity: entity.name().to_string(),
            session: Arc::clone(ctx.session()),
        })
    }
}

/// Runs the statements of one file.
///
/// A rejected statement is logged and skipped; the rest of the file still
/// runs.
pub struct StatementRunner {
    entity: String,
    session: Arc<dyn Session>,
}

impl EntityResource for StatementRunner {
    type Item = SqlLine;

    fn write(&mut self, group: &[SqlLine], ctx: &RunContext) -> Result<u64, SinkError> {
        let mut executed = 0;
        for line in group {
            if ctx.is_cancelled() {
                break;
            }
            match self.session.execute_statement(&line.statement) {
                Ok(()) => executed += 1,
                Err(e) => {
                    warn!(file = %self.entity, error = %e, "Statement rejected");
                    emit!(RecordDropped { stage: "statement" });
                }
            }
        }
        Ok(executed)
    }

    fn close(self, _ctx: &RunContext) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileFormat, RunConfig};
    use crate::error::SessionError;
    use crate::session::{RowIterator, RowSet};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Picky {
        accepted: Mutex<Vec<String>>,
    }

    impl Session for Picky {
        fn execute_query(&self, _sql: &str) -> Result<Box<dyn RowIterator>, SessionError> {
            Ok(Box::new(RowSet::new(Vec::new(), Vec::new())))
        }

        fn execute_statement(&self, sql: &str) -> Result<(), SessionError> {
            if sql.contains("bad") {
                return Err(SessionError::Statement {
                    sql: sql.to_string(),
                    message: "syntax error".to_string(),
                });
            }
            self.accepted.lock().unwrap().push(sql.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_rejected_statement_does_not_stop_the_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let session = Arc::new(Picky::default());
        let ctx = RunContext::new(
            RunConfig::new(dir.path(), FileFormat::Sql),
            session.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        let entity = EntityDescriptor::new("dump.sql", false);
        let line = |statement: &str| SqlLine {
            entity: entity.clone(),
            statement: statement.to_string(),
        };

        let mut runner = StatementFactory.open(&entity, &ctx).unwrap();
        let executed = runner
            .write(&[line("INSERT 1"), line("bad"), line("INSERT 2")], &ctx)
            .unwrap();

        assert_eq!(executed, 2);
        assert_eq!(
            *session.accepted.lock().unwrap(),
            vec!["INSERT 1".to_string(), "INSERT 2".to_string()]
        );
    }
}
