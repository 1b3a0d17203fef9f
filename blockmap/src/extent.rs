// SPDX-License-Identifier: GPL-3.0-only

use std::{fs::File, io, ops::Range, sync::atomic::AtomicBool};

use thiserror::Error;
use tracing::debug;

use crate::{format::bmap::BlockRange, stream, util};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid block size: {0}")]
    InvalidBlockSize(u64),
    #[error("Failed to enumerate extents")]
    Fiemap(#[source] io::Error),
    #[error("Failed to probe block allocation")]
    Fibmap(#[source] io::Error),
    #[error("Failed to seek for data and holes")]
    Seek(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Data/hole layout of an open file, in block units.
///
/// Only the mapped ranges are stored. The unmapped ranges are always derived
/// as the complement so that the two can never disagree.
pub struct ExtentMap {
    block_size: u64,
    total_blocks: u64,
    /// Sorted, non-overlapping, with touching ranges merged.
    mapped: Vec<BlockRange>,
}

impl ExtentMap {
    /// Discover the data/hole layout of `file` using the best mechanism the
    /// underlying filesystem supports, in order: FIEMAP, FIBMAP,
    /// SEEK_DATA/SEEK_HOLE, and finally treating the entire file as data.
    /// An unsupported mechanism moves to the next tier; only a real query
    /// failure is an error.
    pub fn discover(
        file: &File,
        image_size: u64,
        block_size: u64,
        cancel_signal: &AtomicBool,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::InvalidBlockSize(block_size));
        }

        let regions = discover_regions(file, image_size, cancel_signal)?;

        Ok(Self::from_regions(image_size, block_size, regions))
    }

    /// Convert byte regions to merged block ranges. The region start is
    /// aligned down and the end is aligned up, so regions separated by a gap
    /// smaller than one block merge into a single range.
    fn from_regions(image_size: u64, block_size: u64, mut regions: Vec<Range<u64>>) -> Self {
        let total_blocks = util::blocks_for(image_size, block_size);
        let mut mapped = Vec::<BlockRange>::new();

        regions.sort_by_key(|r| r.start);

        for region in regions {
            if region.start >= region.end {
                continue;
            }

            let start = region.start / block_size;
            if start >= total_blocks {
                continue;
            }

            let end = ((region.end - 1) / block_size).min(total_blocks - 1);

            match mapped.last_mut() {
                Some(last) if start <= last.end + 1 => {
                    last.end = last.end.max(end);
                }
                _ => mapped.push(BlockRange { start, end }),
            }
        }

        Self {
            block_size,
            total_blocks,
            mapped,
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Mapped ranges in ascending order.
    pub fn mapped_ranges(&self) -> &[BlockRange] {
        &self.mapped
    }

    pub fn mapped_blocks(&self) -> u64 {
        self.mapped.iter().map(|r| r.blocks()).sum()
    }

    /// Iterate over the holes between mapped ranges, clipped to the half-open
    /// block window `[start, end)`. The iterator is restartable: repeated
    /// calls with overlapping windows yield consistent results because no
    /// internal state is mutated.
    pub fn unmapped_ranges(&self, start: u64, end: u64) -> UnmappedRanges<'_> {
        UnmappedRanges {
            mapped: self.mapped.iter(),
            cursor: start,
            end: end.min(self.total_blocks),
        }
    }
}

/// Lazy complement of the mapped ranges over a fixed window.
pub struct UnmappedRanges<'a> {
    mapped: std::slice::Iter<'a, BlockRange>,
    cursor: u64,
    end: u64,
}

impl Iterator for UnmappedRanges<'_> {
    type Item = BlockRange;

    fn next(&mut self) -> Option<BlockRange> {
        loop {
            if self.cursor >= self.end {
                return None;
            }

            match self.mapped.next() {
                Some(range) => {
                    if range.end + 1 <= self.cursor {
                        // Entirely before the window.
                        continue;
                    } else if range.start >= self.end {
                        let gap = BlockRange {
                            start: self.cursor,
                            end: self.end - 1,
                        };
                        self.cursor = self.end;
                        return Some(gap);
                    } else if range.start > self.cursor {
                        let gap = BlockRange {
                            start: self.cursor,
                            end: range.start - 1,
                        };
                        self.cursor = range.end + 1;
                        return Some(gap);
                    }

                    // The range overlaps the cursor.
                    self.cursor = range.end + 1;
                }
                None => {
                    let gap = BlockRange {
                        start: self.cursor,
                        end: self.end - 1,
                    };
                    self.cursor = self.end;
                    return Some(gap);
                }
            }
        }
    }
}

fn discover_regions(
    file: &File,
    image_size: u64,
    cancel_signal: &AtomicBool,
) -> Result<Vec<Range<u64>>> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Some(regions) = fiemap_regions(file, image_size, cancel_signal).map_err(Error::Fiemap)? {
        debug!("Discovered {} byte regions via FIEMAP", regions.len());
        return Ok(regions);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Some(regions) = fibmap_regions(file, image_size, cancel_signal).map_err(Error::Fibmap)? {
        debug!("Discovered {} byte regions via FIBMAP", regions.len());
        return Ok(regions);
    }

    #[cfg(unix)]
    if let Some(regions) = seek_regions(file, image_size, cancel_signal).map_err(Error::Seek)? {
        debug!("Discovered {} byte regions via SEEK_DATA/SEEK_HOLE", regions.len());
        return Ok(regions);
    }

    debug!("No extent discovery mechanism available; treating the entire file as data");

    if image_size == 0 {
        Ok(vec![])
    } else {
        Ok(vec![0..image_size])
    }
}

/// [Linux only] Enumerate allocated extents via the FIEMAP ioctl. Returns
/// [`None`] if the filesystem does not implement it.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn fiemap_regions(
    file: &File,
    image_size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<Option<Vec<Range<u64>>>> {
    use std::{mem, os::fd::AsRawFd};

    const FS_IOC_FIEMAP: u64 = 0xc020660b;
    const FIEMAP_FLAG_SYNC: u32 = 0x0001;
    const FIEMAP_EXTENT_LAST: u32 = 0x0001;
    const EXTENT_BATCH: usize = 128;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct FiemapExtent {
        fe_logical: u64,
        fe_physical: u64,
        fe_length: u64,
        fe_reserved64: [u64; 2],
        fe_flags: u32,
        fe_reserved: [u32; 3],
    }

    #[repr(C)]
    struct FiemapRequest {
        fm_start: u64,
        fm_length: u64,
        fm_flags: u32,
        fm_mapped_extents: u32,
        fm_extent_count: u32,
        fm_reserved: u32,
        fm_extents: [FiemapExtent; EXTENT_BATCH],
    }

    let fd = file.as_raw_fd();
    let mut regions = Vec::<Range<u64>>::new();
    let mut start = 0u64;

    while start < image_size {
        stream::check_cancel(cancel_signal)?;

        // The request struct is plain old data; the kernel fills it in.
        let mut request: FiemapRequest = unsafe { mem::zeroed() };
        request.fm_start = start;
        request.fm_length = image_size - start;
        request.fm_flags = FIEMAP_FLAG_SYNC;
        request.fm_extent_count = EXTENT_BATCH as u32;

        let ret = unsafe { libc::ioctl(fd, FS_IOC_FIEMAP as _, &mut request) };
        if ret != 0 {
            let e = io::Error::last_os_error();
            return match e.raw_os_error() {
                Some(libc::ENOTTY | libc::EOPNOTSUPP | libc::EINVAL) => Ok(None),
                _ => Err(e),
            };
        }

        if request.fm_mapped_extents == 0 {
            break;
        }

        let mut last = false;

        for extent in &request.fm_extents[..request.fm_mapped_extents as usize] {
            let begin = extent.fe_logical;
            let end = extent.fe_logical.saturating_add(extent.fe_length);

            if begin < image_size {
                regions.push(begin..end.min(image_size));
            }

            if extent.fe_flags & FIEMAP_EXTENT_LAST != 0 {
                last = true;
            }

            start = end;
        }

        if last {
            break;
        }
    }

    Ok(Some(regions))
}

/// [Linux only] Probe allocation block by block via the FIBMAP ioctl. Slower
/// than FIEMAP and usually requires elevated privileges; EPERM is treated as
/// unsupported so that discovery degrades to the next tier.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn fibmap_regions(
    file: &File,
    image_size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<Option<Vec<Range<u64>>>> {
    use std::os::fd::AsRawFd;

    const FIGETBSZ: u64 = 2;
    const FIBMAP: u64 = 1;

    let fd = file.as_raw_fd();

    // FIBMAP works in filesystem block units, not our image block units.
    let mut fs_block_size: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(fd, FIGETBSZ as _, &mut fs_block_size) };
    if ret != 0 {
        let e = io::Error::last_os_error();
        return match e.raw_os_error() {
            Some(libc::ENOTTY | libc::EOPNOTSUPP | libc::EINVAL | libc::EPERM) => Ok(None),
            _ => Err(e),
        };
    } else if fs_block_size <= 0 {
        return Ok(None);
    }

    let fs_block_size = fs_block_size as u64;
    let fs_blocks = util::blocks_for(image_size, fs_block_size);
    if fs_blocks > libc::c_int::MAX as u64 {
        return Ok(None);
    }

    let mut regions = Vec::<Range<u64>>::new();
    let mut run_start = None;

    for index in 0..fs_blocks {
        stream::check_cancel(cancel_signal)?;

        let mut block = index as libc::c_int;
        let ret = unsafe { libc::ioctl(fd, FIBMAP as _, &mut block) };
        if ret != 0 {
            let e = io::Error::last_os_error();
            return match e.raw_os_error() {
                Some(libc::ENOTTY | libc::EOPNOTSUPP | libc::EINVAL | libc::EPERM) => Ok(None),
                _ => Err(e),
            };
        }

        if block != 0 {
            if run_start.is_none() {
                run_start = Some(index);
            }
        } else if let Some(start) = run_start.take() {
            regions.push(start * fs_block_size..index * fs_block_size);
        }
    }

    if let Some(start) = run_start {
        regions.push(start * fs_block_size..image_size);
    }

    Ok(Some(regions))
}

/// Find allocated regions by alternating SEEK_DATA and SEEK_HOLE. Returns
/// [`None`] if the filesystem does not support the seek primitives.
#[cfg(unix)]
fn seek_regions(
    file: &File,
    image_size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<Option<Vec<Range<u64>>>> {
    use rustix::{fs::SeekFrom, io::Errno};

    let mut regions = Vec::<Range<u64>>::new();
    let mut start;
    let mut end = 0;

    loop {
        stream::check_cancel(cancel_signal)?;

        start = match rustix::fs::seek(file, SeekFrom::Data(end)) {
            Ok(offset) => offset,
            Err(e) if e == Errno::NXIO => break,
            Err(e) if e == Errno::INVAL || e == Errno::OPNOTSUPP => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if start >= image_size {
            break;
        }

        end = match rustix::fs::seek(file, SeekFrom::Hole(start)) {
            Ok(offset) => offset,
            Err(e) if e == Errno::NXIO => image_size,
            Err(e) => return Err(e.into()),
        };

        regions.push(start..end.min(image_size));

        if end >= image_size {
            break;
        }
    }

    Ok(Some(regions))
}
