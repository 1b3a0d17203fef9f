// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    sync::atomic::AtomicBool,
};

use ring::digest::Context;
use thiserror::Error;
use tracing::debug;

use crate::{
    format::bmap::{Bmap, BlockRange, ChecksumAlgorithm},
    source::Source,
    stream, util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Expected checksum has {actual} bytes, but {algorithm} digests have {expected}")]
    ChecksumLength {
        algorithm: ChecksumAlgorithm,
        expected: usize,
        actual: usize,
    },
    #[error("Range #{index} ({range}): Expected checksum {expected}, but have {actual}")]
    RangeChecksum {
        index: usize,
        range: BlockRange,
        expected: String,
        actual: String,
    },
    #[error("Range #{index} ({range}): Source ended before the range was fully read")]
    RangeTruncated { index: usize, range: BlockRange },
    #[error("Source contains data past the {image_size} byte image")]
    TrailingData { image_size: u64 },
    #[error("Expected image size {expected}, but have {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("Expected image checksum {expected}, but have {actual}")]
    ImageChecksum { expected: String, actual: String },
    #[error("Failed to read source")]
    SourceRead(#[source] io::Error),
    #[error("Failed to write image")]
    ImageWrite(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Options for [`copy`].
pub struct CopyOptions<'a> {
    /// Block map guiding the sparse copy. Without one, the source is copied
    /// sequentially in full and no holes are created.
    pub bmap: Option<&'a Bmap>,
    /// Expected digest of the full logical image, with holes read as zeros.
    /// The image is only hashed when this is set.
    pub expected_checksum: Option<Vec<u8>>,
    /// Expected size of the written image in bytes.
    pub expected_size: Option<u64>,
    /// Digest algorithm for [`Self::expected_checksum`] when no bmap is
    /// supplied. With a bmap, the document's own algorithm is used.
    pub algorithm: ChecksumAlgorithm,
}

impl Default for CopyOptions<'_> {
    fn default() -> Self {
        Self {
            bmap: None,
            expected_checksum: None,
            expected_size: None,
            algorithm: ChecksumAlgorithm::Sha256,
        }
    }
}

/// Summary of a completed copy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub ranges_copied: u64,
    pub bytes_copied: u64,
    pub holes_skipped: u64,
    pub hole_bytes: u64,
}

/// Copy an image from `source` to `dest`, guided by a bmap when one is
/// supplied. Every requested verification failure is reported as an error;
/// the destination is left behind untrusted, never cleaned up.
pub fn copy(
    source: &mut Source,
    dest: &mut File,
    options: &CopyOptions,
    cancel_signal: &AtomicBool,
) -> Result<CopyReport> {
    let algorithm = options.bmap.map_or(options.algorithm, |b| b.checksum_type);

    if let Some(expected) = &options.expected_checksum
        && expected.len() != algorithm.digest_len()
    {
        return Err(Error::ChecksumLength {
            algorithm,
            expected: algorithm.digest_len(),
            actual: expected.len(),
        });
    }

    let mut image_ctx = options
        .expected_checksum
        .as_ref()
        .map(|_| algorithm.context());

    let report = match options.bmap {
        Some(bmap) => copy_mapped(source, dest, bmap, image_ctx.as_mut(), cancel_signal)?,
        None => copy_sequential(source, dest, image_ctx.as_mut(), cancel_signal)?,
    };

    debug!(
        "Copied {} bytes in {} ranges; skipped {} bytes in {} holes",
        report.bytes_copied, report.ranges_copied, report.hole_bytes, report.holes_skipped,
    );

    if let Some(expected) = options.expected_size {
        let actual = dest.metadata().map_err(Error::ImageWrite)?.len();
        if actual != expected {
            return Err(Error::SizeMismatch { expected, actual });
        }
    }

    // Checked last so that more precise failures are reported first.
    if let (Some(expected), Some(ctx)) = (&options.expected_checksum, image_ctx) {
        let actual = ctx.finish();
        if actual.as_ref() != expected.as_slice() {
            return Err(Error::ImageChecksum {
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }
    }

    Ok(report)
}

/// Map an EOF while positioned inside or just before a range to an error
/// naming that range.
fn range_read_error(e: io::Error, index: usize, range: BlockRange) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::RangeTruncated { index, range }
    } else {
        Error::SourceRead(e)
    }
}

fn copy_mapped(
    source: &mut Source,
    dest: &mut File,
    bmap: &Bmap,
    mut image_ctx: Option<&mut Context>,
    cancel_signal: &AtomicBool,
) -> Result<CopyReport> {
    let block_size = bmap.block_size;

    // Drop any previous destination content first so that unwritten regions
    // read as zeros, then pre-size so they stay holes.
    dest.set_len(0).map_err(Error::ImageWrite)?;
    dest.set_len(bmap.image_size).map_err(Error::ImageWrite)?;

    let mut report = CopyReport::default();
    // Byte offset of the source stream position within the logical image.
    let mut cursor = 0u64;

    for (index, mapped) in bmap.ranges.iter().enumerate() {
        let range = mapped.range;
        let start = range.start * block_size;
        // Only the final range can contain the partial tail block.
        let end = ((range.end + 1) * block_size).min(bmap.image_size);

        if start > cursor {
            let hole = start - cursor;

            source
                .skip(hole)
                .map_err(|e| range_read_error(e, index, range))?;

            if let Some(ctx) = image_ctx.as_deref_mut() {
                util::hash_zeros(ctx, hole, cancel_signal).map_err(Error::SourceRead)?;
            }

            report.holes_skipped += 1;
            report.hole_bytes += hole;
        }

        dest.seek(SeekFrom::Start(start)).map_err(Error::ImageWrite)?;

        let mut range_ctx = bmap.checksum_type.context();

        stream::copy_n_inspect(
            &mut *source,
            &mut *dest,
            end - start,
            |buf| {
                range_ctx.update(buf);
                if let Some(ctx) = image_ctx.as_deref_mut() {
                    ctx.update(buf);
                }
            },
            cancel_signal,
        )
        .map_err(|e| range_read_error(e, index, range))?;

        let actual = range_ctx.finish();
        if actual.as_ref() != mapped.checksum.as_slice() {
            return Err(Error::RangeChecksum {
                index,
                range,
                expected: hex::encode(&mapped.checksum),
                actual: hex::encode(actual),
            });
        }

        report.ranges_copied += 1;
        report.bytes_copied += end - start;
        cursor = end;
    }

    // Trailing hole. A sequential source must still deliver the zeros; a
    // seekable one is simply repositioned.
    if cursor < bmap.image_size {
        let hole = bmap.image_size - cursor;

        source.skip(hole).map_err(Error::SourceRead)?;

        if let Some(ctx) = image_ctx.as_deref_mut() {
            util::hash_zeros(ctx, hole, cancel_signal).map_err(Error::SourceRead)?;
        }

        report.holes_skipped += 1;
        report.hole_bytes += hole;
    }

    // A sequential source is the entire raw image, so any leftover bytes mean
    // the bmap and the source disagree about the image size.
    if !source.is_seekable() {
        let mut probe = [0u8; 1];
        let n = source.read(&mut probe).map_err(Error::SourceRead)?;
        if n != 0 {
            return Err(Error::TrailingData {
                image_size: bmap.image_size,
            });
        }
    }

    Ok(report)
}

fn copy_sequential(
    source: &mut Source,
    dest: &mut File,
    image_ctx: Option<&mut Context>,
    cancel_signal: &AtomicBool,
) -> Result<CopyReport> {
    let copied = match image_ctx {
        Some(ctx) => stream::copy_inspect(
            &mut *source,
            &mut *dest,
            |buf| ctx.update(buf),
            cancel_signal,
        ),
        None => stream::copy(&mut *source, &mut *dest, cancel_signal),
    }
    .map_err(Error::SourceRead)?;

    dest.set_len(copied).map_err(Error::ImageWrite)?;

    Ok(CopyReport {
        ranges_copied: 1,
        bytes_copied: copied,
        holes_skipped: 0,
        hole_bytes: 0,
    })
}
