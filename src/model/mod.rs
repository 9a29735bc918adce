//! Value and record types shared by every stage.

pub mod record;
pub mod value;

pub use record::{
    END_OF_ENTITY_PREFIX, EntityDescriptor, Field, Record, RenderedRecord, Routed, SeriesSchema,
    SqlLine,
};
pub use value::{DataType, FieldValue};
