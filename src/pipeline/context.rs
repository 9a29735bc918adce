//! Run-scoped values shared with every stage.

use dashmap::DashMap;
use encoding_rs::{Encoding, UTF_8};
use encoding_rs_io::DecodeReaderBytesBuilder;
use std::borrow::Cow;
use std::io::Read;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::error::ConfigError;
use crate::model::DataType;
use crate::session::Session;

/// Series types and device alignment known before data arrives.
///
/// Filled by the structure sidecar pipeline and by schema lookups, read by
/// CSV sources. Keys are raw (unquoted) paths.
#[derive(Debug, Default)]
pub struct SchemaCache {
    series: DashMap<String, DataType>,
    devices: DashMap<String, bool>,
}

impl SchemaCache {
    pub fn insert_series(&self, path: impl Into<String>, data_type: DataType) {
        self.series.insert(path.into(), data_type);
    }

    pub fn insert_device(&self, path: impl Into<String>, aligned: bool) {
        self.devices.insert(path.into(), aligned);
    }

    pub fn series_type(&self, path: &str) -> Option<DataType> {
        self.series.get(path).map(|t| *t)
    }

    pub fn device_alignment(&self, path: &str) -> Option<bool> {
        self.devices.get(path).map(|a| *a)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

struct ContextInner {
    config: RunConfig,
    session: Arc<dyn Session>,
    schema: SchemaCache,
    encoding: &'static Encoding,
    shutdown: CancellationToken,
}

/// Handle passed to every stage's `transform`.
///
/// Cloning is cheap; all clones share the same cache and token.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<ContextInner>,
}

impl RunContext {
    pub fn new(
        config: RunConfig,
        session: Arc<dyn Session>,
        shutdown: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let encoding = config.text_encoding()?;
        Ok(Self {
            inner: Arc::new(ContextInner {
                config,
                session,
                schema: SchemaCache::default(),
                encoding,
                shutdown,
            }),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.inner.config
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.inner.session
    }

    pub fn schema(&self) -> &SchemaCache {
        &self.inner.schema
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.inner.encoding
    }

    /// Wrap `reader` so it yields UTF-8 regardless of the file encoding.
    pub fn decode_reader<'a, R: Read + Send + 'a>(&self, reader: R) -> Box<dyn Read + Send + 'a> {
        if self.inner.encoding == UTF_8 {
            return Box::new(reader);
        }
        Box::new(
            DecodeReaderBytesBuilder::new()
                .encoding(Some(self.inner.encoding))
                .build(reader),
        )
    }

    /// Encode `text` for writing.
    pub fn encode<'a>(&self, text: &'a str) -> Cow<'a, [u8]> {
        if self.inner.encoding == UTF_8 {
            return Cow::Borrowed(text.as_bytes());
        }
        let (bytes, _, _) = self.inner.encoding.encode(text);
        bytes
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("directory", &self.inner.config.directory)
            .field("format", &self.inner.config.format)
            .field("encoding", &self.inner.encoding.name())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::FileFormat;
    use crate::error::SessionError;
    use crate::session::{RowIterator, RowSet};

    /// Session that answers every query with an empty result.
    pub struct NullSession;

    impl Session for NullSession {
        fn execute_query(&self, _sql: &str) -> Result<Box<dyn RowIterator>, SessionError> {
            Ok(Box::new(RowSet::new(Vec::new(), Vec::new())))
        }

        fn execute_statement(&self, _sql: &str) -> Result<(), SessionError> {
            Ok(())
        }
    }

    pub fn context(directory: &std::path::Path, format: FileFormat) -> RunContext {
        RunContext::new(
            RunConfig::new(directory, format),
            Arc::new(NullSession),
            CancellationToken::new(),
        )
        .unwrap()
    }
}
