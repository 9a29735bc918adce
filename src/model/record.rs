//! Records flowing through a pipeline.
//!
//! Every item a sink receives belongs to exactly one entity (a device path).
//! A unit closes its stream for an entity with an end-of-entity marker: an
//! item whose entity path carries the [`END_OF_ENTITY_PREFIX`] and which has
//! no payload.

use serde::{Deserialize, Serialize};

use super::value::{DataType, FieldValue};

/// Reserved prefix marking "no more records for this entity from this unit".
pub const END_OF_ENTITY_PREFIX: &str = "finish,";

/// Owning entity of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub path: String,
    pub aligned: bool,
}

impl EntityDescriptor {
    pub fn new(path: impl Into<String>, aligned: bool) -> Self {
        Self {
            path: path.into(),
            aligned,
        }
    }

    /// The marker descriptor for this entity.
    pub fn end_marker(&self) -> Self {
        Self {
            path: format!("{END_OF_ENTITY_PREFIX}{}", self.name()),
            aligned: self.aligned,
        }
    }

    pub fn is_end_marker(&self) -> bool {
        self.path.starts_with(END_OF_ENTITY_PREFIX)
    }

    /// Entity name with any marker prefix removed.
    pub fn name(&self) -> &str {
        self.path
            .strip_prefix(END_OF_ENTITY_PREFIX)
            .unwrap_or(&self.path)
    }
}

/// A named cell of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub column: String,
    pub value: FieldValue,
}

impl Field {
    pub fn new(column: impl Into<String>, value: FieldValue) -> Self {
        Self {
            column: column.into(),
            value,
        }
    }
}

/// One row of a time series.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub entity: EntityDescriptor,
    pub timestamp: i64,
    pub fields: Vec<Field>,
}

impl Record {
    pub fn new(entity: EntityDescriptor, timestamp: i64, fields: Vec<Field>) -> Self {
        Self {
            entity,
            timestamp,
            fields,
        }
    }

    /// End-of-entity marker for `entity`.
    pub fn end_of_entity(entity: &EntityDescriptor) -> Self {
        Self {
            entity: entity.end_marker(),
            timestamp: 0,
            fields: Vec::new(),
        }
    }
}

/// A record rendered to text cells, ready for a file writer.
///
/// `columns` holds the header (without the time column); `cells[i]` is the
/// rendered value of `columns[i]`, `None` when the value is null.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedRecord {
    pub entity: EntityDescriptor,
    pub timestamp: i64,
    pub columns: Vec<String>,
    pub cells: Vec<Option<String>>,
}

impl RenderedRecord {
    pub fn end_of_entity(entity: &EntityDescriptor) -> Self {
        Self {
            entity: entity.end_marker(),
            timestamp: 0,
            columns: Vec::new(),
            cells: Vec::new(),
        }
    }
}

/// One statement line read from a SQL file, keyed by its target entity.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlLine {
    pub entity: EntityDescriptor,
    pub statement: String,
}

impl SqlLine {
    pub fn end_of_entity(entity: &EntityDescriptor) -> Self {
        Self {
            entity: entity.end_marker(),
            statement: String::new(),
        }
    }
}

/// One series of the structure sidecar.
///
/// `columns` and `values` hold the raw schema row as the database reported
/// it; `series` and `data_type` are parsed out of it.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSchema {
    pub entity: EntityDescriptor,
    pub series: String,
    pub data_type: DataType,
    pub columns: Vec<String>,
    pub values: Vec<String>,
}

impl SeriesSchema {
    pub fn end_of_entity(entity: &EntityDescriptor) -> Self {
        Self {
            entity: entity.end_marker(),
            series: String::new(),
            data_type: DataType::Text,
            columns: Vec::new(),
            values: Vec::new(),
        }
    }
}

/// Items a sink can route by entity.
pub trait Routed: Send + 'static {
    fn entity(&self) -> &EntityDescriptor;

    fn is_end_marker(&self) -> bool {
        self.entity().is_end_marker()
    }
}

impl Routed for Record {
    fn entity(&self) -> &EntityDescriptor {
        &self.entity
    }
}

impl Routed for RenderedRecord {
    fn entity(&self) -> &EntityDescriptor {
        &self.entity
    }
}

impl Routed for SeriesSchema {
    fn entity(&self) -> &EntityDescriptor {
        &self.entity
    }
}

impl Routed for SqlLine {
    fn entity(&self) -> &EntityDescriptor {
        &self.entity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_marker_keeps_entity_name() {
        let entity = EntityDescriptor::new("root.sg.d1", true);
        let marker = Record::end_of_entity(&entity);

        assert!(marker.is_end_marker());
        assert_eq!(marker.entity.path, "finish,root.sg.d1");
        assert_eq!(marker.entity.name(), "root.sg.d1");
        assert!(marker.fields.is_empty());
        assert!(!entity.is_end_marker());
    }

    #[test]
    fn test_marker_of_marker_is_stable() {
        let entity = EntityDescriptor::new("root.sg.d1", false);
        assert_eq!(entity.end_marker().end_marker(), entity.end_marker());
    }
}
