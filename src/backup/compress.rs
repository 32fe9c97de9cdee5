use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, BufWriter, Read};
use std::path::Path;

use crate::errors::Result;

/// Compresses everything readable from `source` into a gzip file at `dest_path`.
///
/// The destination is created (or truncated). The gzip trailer is written and
/// the file flushed before returning, so the size on disk is final.
///
/// # Arguments
/// * `source` - Uncompressed input, typically a dump tool's stdout.
/// * `dest_path` - Path of the `.gz` file to write.
///
/// # Returns
/// The number of uncompressed bytes read from `source`.
pub fn gzip_stream_to_file<R: Read>(source: &mut R, dest_path: &Path) -> Result<u64> {
    let file = File::create(dest_path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let copied = io::copy(source, &mut encoder)?;
    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(copied)
}
