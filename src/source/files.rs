//! Input file discovery and opening.

use snafu::prelude::*;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::codec::Compression;
use crate::config::STRUCTURE_FILE_NAME;
use crate::error::{ListInputSnafu, OpenInputSnafu, StageError};
use crate::pipeline::RunContext;

/// Data files of the run directory, sorted by name.
///
/// Only files with the format's extension are listed; the catalog and the
/// structure sidecar are never data files.
pub fn list_data_files(ctx: &RunContext) -> Result<Vec<PathBuf>, StageError> {
    let config = ctx.config();
    let directory = &config.directory;
    let extension = config.format.extension();
    let catalog = config.format.catalog_file_name();
    let context = || ListInputSnafu {
        path: directory.display().to_string(),
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(directory).with_context(|_| context())? {
        let path = entry.with_context(|_| context())?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == STRUCTURE_FILE_NAME || name == catalog {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        if matches {
            files.push(path);
        }
    }
    files.sort();
    debug!(directory = %directory.display(), files = files.len(), "Listed input files");
    Ok(files)
}

/// Open `path` as UTF-8 text, decompressing and transcoding as needed.
pub fn open_text(
    path: &Path,
    compression: Option<Compression>,
    ctx: &RunContext,
) -> Result<Box<dyn Read + Send>, StageError> {
    let file = File::open(path).context(OpenInputSnafu {
        path: path.display().to_string(),
    })?;
    let reader = BufReader::new(file);
    let reader: Box<dyn Read + Send> = match compression {
        Some(codec) => codec.decoder(reader),
        None => Box::new(reader),
    };
    Ok(ctx.decode_reader(reader))
}

/// File name used in logs and as a fallback entity.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
