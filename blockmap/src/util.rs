// SPDX-License-Identifier: GPL-3.0-only

use std::{io, sync::atomic::AtomicBool};

use ring::digest::Context;

use crate::stream;

pub const ZEROS: [u8; 16384] = [0u8; 16384];

/// Number of blocks needed to cover `size` bytes. The last block may be
/// partial.
pub fn blocks_for(size: u64, block_size: u64) -> u64 {
    size.div_ceil(block_size)
}

/// Feed `size` zero bytes into a digest context, as if a hole of that size
/// had been read.
pub fn hash_zeros(
    context: &mut Context,
    mut size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    while size > 0 {
        stream::check_cancel(cancel_signal)?;

        let n = size.min(ZEROS.len() as u64) as usize;
        context.update(&ZEROS[..n]);

        size -= n as u64;
    }

    Ok(())
}
