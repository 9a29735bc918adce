//! Output file naming and the shared catalog.

use snafu::prelude::*;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::debug;

use crate::config::{CATALOG_LINE_END, FileNaming, RunConfig};
use crate::error::{OpenResourceSnafu, SinkError, WriteCatalogSnafu};
use crate::pipeline::RunContext;

/// An output file opened for one entity.
pub struct OpenedFile {
    pub path: PathBuf,
    pub file: File,
    /// The entity already had an output earlier in this run; the file was
    /// opened for appending.
    pub reopened: bool,
}

/// Assigns file names to entities.
///
/// In per-entity mode a file is `<entity>.<ext>`, with path separators and
/// `%` percent-escaped so every file stays inside the directory. In catalog
/// mode files are
/// numbered from 1 in open order and every assignment is appended to the
/// catalog as `<n>,<entity>`.
pub struct FileLayout {
    directory: PathBuf,
    extension: &'static str,
    naming: FileNaming,
    catalog_name: String,
    next_number: u64,
    assigned: HashMap<String, PathBuf>,
    catalog: Option<BufWriter<File>>,
}

impl FileLayout {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            extension: config.format.extension(),
            naming: config.naming,
            catalog_name: config.format.catalog_file_name(),
            next_number: 0,
            assigned: HashMap::new(),
            catalog: None,
        }
    }

    /// Open the output file of `entity`, assigning it a name on first use.
    pub fn open(&mut self, entity: &str, ctx: &RunContext) -> Result<OpenedFile, SinkError> {
        if let Some(path) = self.assigned.get(entity) {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .context(OpenResourceSnafu {
                    entity,
                    path: path.display().to_string(),
                })?;
            return Ok(OpenedFile {
                path: path.clone(),
                file,
                reopened: true,
            });
        }

        let path = match self.naming {
            FileNaming::PerEntity => self
                .directory
                .join(format!("{}.{}", file_stem(entity), self.extension)),
            FileNaming::Catalog => {
                self.next_number += 1;
                let number = self.next_number;
                self.append_catalog(number, entity, ctx)?;
                self.directory.join(format!("{number}.{}", self.extension))
            }
        };
        let file = File::create(&path).context(OpenResourceSnafu {
            entity,
            path: path.display().to_string(),
        })?;
        debug!(entity, path = %path.display(), "Opened output file");
        self.assigned.insert(entity.to_string(), path.clone());
        Ok(OpenedFile {
            path,
            file,
            reopened: false,
        })
    }

    fn append_catalog(&mut self, number: u64, entity: &str, ctx: &RunContext) -> Result<(), SinkError> {
        let path = self.directory.join(&self.catalog_name);
        let context = || WriteCatalogSnafu {
            path: path.display().to_string(),
        };
        if self.catalog.is_none() {
            let file = File::create(&path).with_context(|_| context())?;
            self.catalog = Some(BufWriter::new(file));
        }
        if let Some(catalog) = self.catalog.as_mut() {
            let line = format!("{number},{entity}{CATALOG_LINE_END}");
            catalog
                .write_all(&ctx.encode(&line))
                .with_context(|_| context())?;
        }
        Ok(())
    }

    /// Flush the catalog.
    pub fn finish(&mut self) -> Result<(), SinkError> {
        if let Some(mut catalog) = self.catalog.take() {
            let path = self.directory.join(&self.catalog_name);
            catalog.flush().context(WriteCatalogSnafu {
                path: path.display().to_string(),
            })?;
        }
        Ok(())
    }
}

fn file_stem(entity: &str) -> String {
    let mut stem = String::with_capacity(entity.len());
    for c in entity.chars() {
        match c {
            '%' => stem.push_str("%25"),
            '/' => stem.push_str("%2F"),
            '\\' => stem.push_str("%5C"),
            _ => stem.push(c),
        }
    }
    stem
}
