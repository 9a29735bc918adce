//! Per-entity resource routing.
//!
//! The router buffers the merged stream into batches, groups each batch by
//! entity in arrival order and hands every group to that entity's output
//! resource. Resources are opened on the first data record of an entity and
//! closed after the batch in which its end-of-entity marker arrives.

use dashmap::DashMap;
use dashmap::mapref::one::RefMut;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error};

use crate::emit;
use crate::error::SinkError;
use crate::metrics::events::{
    EntityFailed, EntityFinished, OpenResources, RecordDropped, RowsWritten,
};
use crate::model::{EntityDescriptor, Routed};
use crate::pipeline::{ProgressTracker, RunContext, Sink};

/// An open output for one entity.
pub trait EntityResource: Send {
    type Item;

    /// Serialize and write one group; returns the number of rows written.
    fn write(&mut self, group: &[Self::Item], ctx: &RunContext) -> Result<u64, SinkError>;

    /// Flush and release the resource.
    fn close(self, ctx: &RunContext) -> Result<(), SinkError>;
}

/// Opens resources for entities on demand.
pub trait ResourceFactory: Send + 'static {
    type Item: Routed;
    type Resource: EntityResource<Item = Self::Item>;

    fn open(
        &mut self,
        entity: &EntityDescriptor,
        ctx: &RunContext,
    ) -> Result<Self::Resource, SinkError>;

    /// Release factory-wide state once every resource is closed.
    fn finish(&mut self, _ctx: &RunContext) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Concurrent map from entity name to its open resource.
///
/// At most one resource per entity exists at a time. Opens and closes are
/// reported to the progress tracker so the open count is observable.
pub struct EntityResourceMap<R> {
    resources: DashMap<String, R>,
    progress: Arc<ProgressTracker>,
}

impl<R> EntityResourceMap<R> {
    pub fn new(progress: Arc<ProgressTracker>) -> Self {
        Self {
            resources: DashMap::new(),
            progress,
        }
    }

    /// The entity's resource, opened with `open` when absent.
    pub fn get_or_open<F>(&self, entity: &str, open: F) -> Result<RefMut<'_, String, R>, SinkError>
    where
        F: FnOnce() -> Result<R, SinkError>,
    {
        self.resources
            .entry(entity.to_string())
            .or_try_insert_with(|| {
                let resource = open()?;
                self.progress.resource_opened();
                Ok(resource)
            })
    }

    /// Detach the entity's resource; the caller closes it.
    pub fn remove(&self, entity: &str) -> Option<R> {
        let (_, resource) = self.resources.remove(entity)?;
        self.progress.resource_closed();
        Some(resource)
    }

    /// Detach every resource.
    pub fn drain(&self) -> Vec<(String, R)> {
        let names: Vec<String> = self.resources.iter().map(|e| e.key().clone()).collect();
        names
            .into_iter()
            .filter_map(|name| self.remove(&name).map(|r| (name, r)))
            .collect()
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.resources.contains_key(entity)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Records of one entity within a batch.
struct Group<T> {
    entity: EntityDescriptor,
    items: Vec<T>,
    markers: usize,
}

/// Sink routing items to per-entity resources built by a factory.
pub struct EntityRouter<F: ResourceFactory> {
    name: &'static str,
    factory: F,
    resources: EntityResourceMap<F::Resource>,
    failed: HashSet<String>,
    progress: Arc<ProgressTracker>,
}

impl<F: ResourceFactory> EntityRouter<F> {
    pub fn new(name: &'static str, factory: F) -> Self {
        let progress = Arc::new(ProgressTracker::new());
        Self {
            name,
            factory,
            resources: EntityResourceMap::new(Arc::clone(&progress)),
            failed: HashSet::new(),
            progress,
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn route_batch(&mut self, batch: Vec<F::Item>, ctx: &RunContext) {
        let mut groups: IndexMap<String, Group<F::Item>> = IndexMap::new();
        for item in batch {
            let entity = item.entity();
            let group = groups
                .entry(entity.name().to_string())
                .or_insert_with(|| Group {
                    entity: EntityDescriptor::new(entity.name(), entity.aligned),
                    items: Vec::new(),
                    markers: 0,
                });
            if item.is_end_marker() {
                group.markers += 1;
            } else {
                group.items.push(item);
            }
        }

        let mut finished = Vec::new();
        for (name, group) in groups {
            if ctx.is_cancelled() {
                break;
            }
            if !group.items.is_empty() && !self.failed.contains(&name) {
                self.write_group(&name, &group, ctx);
            }
            if group.markers > 0 && !self.failed.contains(&name) {
                for _ in 0..group.markers {
                    self.progress.finish_one();
                    emit!(EntityFinished { sink: self.name });
                }
                finished.push(name);
            }
        }

        for name in finished {
            if let Some(resource) = self.resources.remove(&name) {
                debug!(sink = self.name, entity = %name, "Closing entity output");
                if let Err(e) = resource.close(ctx) {
                    self.fail_entity(&name, &e);
                }
            }
        }
        emit!(OpenResources {
            sink: self.name,
            count: self.resources.len(),
        });
    }

    fn write_group(&mut self, name: &str, group: &Group<F::Item>, ctx: &RunContext) {
        let factory = &mut self.factory;
        let opened = match self
            .resources
            .get_or_open(name, || factory.open(&group.entity, ctx))
        {
            Ok(mut resource) => Ok(resource.write(&group.items, ctx)),
            Err(e) => Err(e),
        };
        let written = match opened {
            Ok(written) => written,
            Err(e) => {
                self.fail_entity(name, &e);
                return;
            }
        };

        match written {
            Ok(rows) => {
                self.progress.add_rows(rows);
                emit!(RowsWritten {
                    sink: self.name,
                    count: rows,
                });
            }
            Err(e) => {
                error!(sink = self.name, entity = %name, error = %e, rows = group.items.len(), "Dropping group after write failure");
                for _ in 0..group.items.len() {
                    emit!(RecordDropped { stage: self.name });
                }
            }
        }
    }

    fn fail_entity(&mut self, name: &str, e: &SinkError) {
        error!(sink = self.name, entity = %name, error = %e, "Dropping entity after output failure");
        emit!(EntityFailed { sink: self.name });
        self.failed.insert(name.to_string());
    }
}

impl<F: ResourceFactory> Sink for EntityRouter<F> {
    type Input = F::Item;

    fn name(&self) -> &'static str {
        self.name
    }

    fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.progress)
    }

    fn transform(
        &mut self,
        input: &mut dyn Iterator<Item = F::Item>,
        ctx: &RunContext,
    ) -> Result<(), SinkError> {
        let batch_size = ctx.config().batch_size;
        loop {
            let batch: Vec<F::Item> = (&mut *input).take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            self.route_batch(batch, ctx);
            if ctx.is_cancelled() {
                break;
            }
        }
        Ok(())
    }

    fn close(&mut self, ctx: &RunContext) -> Result<(), SinkError> {
        for (name, resource) in self.resources.drain() {
            debug!(sink = self.name, entity = %name, "Closing unfinished entity output");
            if let Err(e) = resource.close(ctx) {
                self.fail_entity(&name, &e);
            }
        }
        emit!(OpenResources {
            sink: self.name,
            count: 0,
        });
        self.factory.finish(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileFormat;
    use crate::model::{Field, FieldValue, Record};
    use crate::pipeline::context::test_support::context;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Journal {
        opened: Vec<String>,
        closed: Vec<String>,
        rows: Vec<(String, i64)>,
    }

    struct JournalFactory {
        journal: Arc<Mutex<Journal>>,
        broken: Option<&'static str>,
        unwritable: Option<i64>,
    }

    struct JournalResource {
        entity: String,
        journal: Arc<Mutex<Journal>>,
        unwritable: Option<i64>,
    }

    impl EntityResource for JournalResource {
        type Item = Record;

        fn write(&mut self, group: &[Record], _ctx: &RunContext) -> Result<u64, SinkError> {
            if group.iter().any(|r| Some(r.timestamp) == self.unwritable) {
                return Err(SinkError::WriteResource {
                    source: std::io::Error::other("short write"),
                    entity: self.entity.clone(),
                });
            }
            let mut journal = self.journal.lock().unwrap();
            for record in group {
                journal.rows.push((self.entity.clone(), record.timestamp));
            }
            Ok(group.len() as u64)
        }

        fn close(self, _ctx: &RunContext) -> Result<(), SinkError> {
            self.journal.lock().unwrap().closed.push(self.entity);
            Ok(())
        }
    }

    impl ResourceFactory for JournalFactory {
        type Item = Record;
        type Resource = JournalResource;

        fn open(
            &mut self,
            entity: &EntityDescriptor,
            _ctx: &RunContext,
        ) -> Result<JournalResource, SinkError> {
            if self.broken == Some(entity.name()) {
                return Err(SinkError::OpenResource {
                    source: std::io::Error::other("disk full"),
                    entity: entity.name().to_string(),
                    path: "broken".to_string(),
                });
            }
            self.journal
                .lock()
                .unwrap()
                .opened
                .push(entity.name().to_string());
            Ok(JournalResource {
                entity: entity.name().to_string(),
                journal: Arc::clone(&self.journal),
                unwritable: self.unwritable,
            })
        }
    }

    fn router(broken: Option<&'static str>) -> (EntityRouter<JournalFactory>, Arc<Mutex<Journal>>) {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let factory = JournalFactory {
            journal: Arc::clone(&journal),
            broken,
            unwritable: None,
        };
        (EntityRouter::new("journal", factory), journal)
    }

    fn record(entity: &str, timestamp: i64) -> Record {
        Record::new(
            EntityDescriptor::new(entity, false),
            timestamp,
            vec![Field::new("s1", FieldValue::Int64(timestamp))],
        )
    }

    fn marker(entity: &str) -> Record {
        Record::end_of_entity(&EntityDescriptor::new(entity, false))
    }

    #[test]
    fn test_interleaved_entities_keep_order_and_close_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path(), FileFormat::Csv);
        let (mut router, journal) = router(None);
        let progress = router.progress();

        let items = vec![
            record("d1", 1),
            record("d2", 1),
            record("d1", 2),
            record("d2", 2),
            marker("d1"),
            record("d2", 3),
            marker("d2"),
        ];
        router.transform(&mut items.into_iter(), &ctx).unwrap();
        router.close(&ctx).unwrap();

        let journal = journal.lock().unwrap();
        assert_eq!(journal.opened, vec!["d1", "d2"]);
        assert_eq!(journal.closed, vec!["d1", "d2"]);
        let d2: Vec<i64> = journal
            .rows
            .iter()
            .filter(|(e, _)| e == "d2")
            .map(|(_, t)| *t)
            .collect();
        assert_eq!(d2, vec![1, 2, 3]);

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.finished, 2);
        assert_eq!(snapshot.rows, 5);
        assert_eq!(progress.open_resources(), 0);
    }

    #[test]
    fn test_small_batches_close_after_marker_batch() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = crate::config::RunConfig::new(dir.path(), FileFormat::Csv);
        config.batch_size = 2;
        let ctx = RunContext::new(
            config,
            Arc::new(crate::pipeline::context::test_support::NullSession),
            tokio_util::sync::CancellationToken::new(),
        )
        .unwrap();
        let (mut router, journal) = router(None);
        let progress = router.progress();

        let items = vec![record("d1", 1), record("d1", 2), record("d1", 3), marker("d1")];
        let mut input = items.into_iter();
        router.transform(&mut input, &ctx).unwrap();

        assert_eq!(progress.open_resources(), 0);
        let journal = journal.lock().unwrap();
        assert_eq!(journal.opened.len(), 1);
        assert_eq!(journal.closed.len(), 1);
        assert_eq!(journal.rows.len(), 3);
    }

    #[test]
    fn test_entity_with_only_a_marker_counts_as_finished() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path(), FileFormat::Csv);
        let (mut router, journal) = router(None);
        let progress = router.progress();

        router
            .transform(&mut vec![marker("empty")].into_iter(), &ctx)
            .unwrap();

        assert_eq!(progress.snapshot().finished, 1);
        assert!(journal.lock().unwrap().opened.is_empty());
    }

    #[test]
    fn test_open_failure_isolates_entity() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path(), FileFormat::Csv);
        let (mut router, journal) = router(Some("bad"));
        let progress = router.progress();

        let items = vec![
            record("bad", 1),
            record("good", 1),
            record("bad", 2),
            marker("bad"),
            marker("good"),
        ];
        router.transform(&mut items.into_iter(), &ctx).unwrap();
        router.close(&ctx).unwrap();

        let journal = journal.lock().unwrap();
        assert_eq!(journal.opened, vec!["good"]);
        assert_eq!(journal.rows, vec![("good".to_string(), 1)]);
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.finished, 1);
        assert_eq!(snapshot.rows, 1);
    }

    #[test]
    fn test_write_failure_drops_group_but_keeps_entity() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = crate::config::RunConfig::new(dir.path(), FileFormat::Csv);
        config.batch_size = 2;
        let ctx = RunContext::new(
            config,
            Arc::new(crate::pipeline::context::test_support::NullSession),
            tokio_util::sync::CancellationToken::new(),
        )
        .unwrap();
        let journal = Arc::new(Mutex::new(Journal::default()));
        let mut router = EntityRouter::new(
            "journal",
            JournalFactory {
                journal: Arc::clone(&journal),
                broken: None,
                unwritable: Some(2),
            },
        );
        let progress = router.progress();

        let items = vec![record("d1", 1), record("d1", 2), record("d1", 3), marker("d1")];
        router.transform(&mut items.into_iter(), &ctx).unwrap();
        router.close(&ctx).unwrap();

        let journal = journal.lock().unwrap();
        assert_eq!(journal.rows, vec![("d1".to_string(), 3)]);
        assert_eq!(journal.opened.len(), 1);
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.finished, 1);
        assert_eq!(snapshot.rows, 1);
        assert_eq!(progress.open_resources(), 0);
    }

    #[test]
    fn test_close_releases_unfinished_outputs() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path(), FileFormat::Csv);
        let (mut router, journal) = router(None);
        let progress = router.progress();

        router
            .transform(&mut vec![record("d1", 1)].into_iter(), &ctx)
            .unwrap();
        assert_eq!(progress.open_resources(), 1);

        router.close(&ctx).unwrap();
        assert_eq!(progress.open_resources(), 0);
        assert_eq!(journal.lock().unwrap().closed, vec!["d1"]);
    }
}
