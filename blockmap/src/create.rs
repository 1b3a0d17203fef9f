// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Seek, SeekFrom},
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::debug;

use crate::{
    extent::{self, ExtentMap},
    format::bmap::{Bmap, ChecksumAlgorithm, FormatVersion, MappedRange},
    stream, util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to discover data ranges")]
    Extent(#[from] extent::Error),
    #[error("Failed to query image size")]
    Size(#[source] io::Error),
    #[error("Failed to read image data")]
    Read(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Generate a block map for `file` in a single sequential pass.
///
/// Mapped ranges are read once, feeding a per-range digest and the
/// whole-image digest. Holes feed zeros to the whole-image digest without
/// touching the file. The result is deterministic: identical content and
/// block size always produce an identical document.
pub fn generate(
    file: &mut File,
    block_size: u64,
    algorithm: ChecksumAlgorithm,
    cancel_signal: &AtomicBool,
) -> Result<Bmap> {
    let image_size = file.seek(SeekFrom::End(0)).map_err(Error::Size)?;

    let extents = ExtentMap::discover(file, image_size, block_size, cancel_signal)?;

    debug!(
        "Mapped {} of {} blocks ({} byte block size)",
        extents.mapped_blocks(),
        extents.total_blocks(),
        block_size,
    );

    let mut image_ctx = algorithm.context();
    let mut ranges = Vec::with_capacity(extents.mapped_ranges().len());
    // Byte offset up to which the whole-image digest has been fed.
    let mut cursor = 0u64;

    for &range in extents.mapped_ranges() {
        let start = range.start * block_size;
        // Only the final range can contain the partial tail block.
        let end = ((range.end + 1) * block_size).min(image_size);

        util::hash_zeros(&mut image_ctx, start - cursor, cancel_signal).map_err(Error::Read)?;

        file.seek(SeekFrom::Start(start)).map_err(Error::Read)?;

        let mut range_ctx = algorithm.context();

        stream::copy_n_inspect(
            &mut *file,
            io::sink(),
            end - start,
            |buf| {
                range_ctx.update(buf);
                image_ctx.update(buf);
            },
            cancel_signal,
        )
        .map_err(Error::Read)?;

        ranges.push(MappedRange {
            range,
            checksum: range_ctx.finish().as_ref().to_vec(),
        });

        cursor = end;
    }

    util::hash_zeros(&mut image_ctx, image_size - cursor, cancel_signal).map_err(Error::Read)?;

    Ok(Bmap {
        version: FormatVersion::current(),
        image_size,
        block_size,
        blocks_count: extents.total_blocks(),
        mapped_blocks_count: extents.mapped_blocks(),
        checksum_type: algorithm,
        image_checksum: image_ctx.finish().as_ref().to_vec(),
        ranges,
    })
}
