// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Write},
    sync::atomic::{AtomicBool, Ordering},
};

/// Common function for reading a structure from a reader.
pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

/// Common function for writing a structure to a writer.
pub trait ToWriter<W: Write>: Sized {
    type Error;

    fn to_writer(&self, writer: W) -> Result<(), Self::Error>;
}

/// Extensions for readers to read and discard data (eg. for skipping holes in
/// sequential streams).
pub trait ReadDiscardExt {
    fn read_discard(&mut self, size: u64) -> io::Result<u64>;

    fn read_discard_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.read_discard(size)?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to read {size} bytes, but reached EOF after {n} bytes"),
            ));
        }
        Ok(())
    }
}

impl<R: Read> ReadDiscardExt for R {
    fn read_discard(&mut self, size: u64) -> io::Result<u64> {
        io::copy(&mut self.take(size), &mut io::sink())
    }
}

/// Returns an I/O error with the [`io::ErrorKind::Interrupted`] type if
/// `cancel_signal` is true. This should be called frequently in I/O loops for
/// cancellation to be responsive.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}

/// Copy exactly `size` bytes from `reader` to `writer`, invoking `inspect`
/// after every buffer read iteration. If either `reader` or `writer` reaches
/// EOF before `size` bytes are copied, an error is returned. The operation is
/// cancelled on the next loop iteration if `cancel_signal` is set to `true`.
pub fn copy_n_inspect(
    mut reader: impl Read,
    mut writer: impl Write,
    mut size: u64,
    mut inspect: impl FnMut(&[u8]),
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let mut buf = [0u8; 16384];

    while size > 0 {
        check_cancel(cancel_signal)?;

        let to_read = size.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..to_read])?;

        inspect(&buf[..to_read]);

        writer.write_all(&buf[..to_read])?;

        size -= to_read as u64;
    }

    Ok(())
}

/// Copy exactly `size` bytes from `reader` to `writer`.
pub fn copy_n(
    reader: impl Read,
    writer: impl Write,
    size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    copy_n_inspect(reader, writer, size, |_| {}, cancel_signal)
}

/// Copy data from `reader` to `writer` until `reader` reaches EOF, invoking
/// `inspect` after every buffer read iteration. If `writer` reaches EOF before
/// `reader` does, an error is returned. The operation is cancelled on the next
/// loop iteration if `cancel_signal` is set to `true`.
pub fn copy_inspect(
    mut reader: impl Read,
    mut writer: impl Write,
    mut inspect: impl FnMut(&[u8]),
    cancel_signal: &AtomicBool,
) -> io::Result<u64> {
    let mut buf = [0u8; 16384];
    let mut copied = 0;

    loop {
        check_cancel(cancel_signal)?;

        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }

        inspect(&buf[..n]);

        writer.write_all(&buf[..n])?;

        copied += n as u64;
    }

    Ok(copied)
}

/// Copy data from `reader` to `writer` until `reader` reaches EOF.
pub fn copy(reader: impl Read, writer: impl Write, cancel_signal: &AtomicBool) -> io::Result<u64> {
    copy_inspect(reader, writer, |_| {}, cancel_signal)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Cursor, Read, Seek, SeekFrom},
        sync::atomic::{AtomicBool, Ordering},
    };

    use ring::digest::Context;

    use super::*;

    const FOOBAR_SHA256: [u8; 32] = [
        0xc3, 0xab, 0x8f, 0xf1, 0x37, 0x20, 0xe8, 0xad, 0x90, 0x47, 0xdd, 0x39, 0x46, 0x6b, 0x3c,
        0x89, 0x74, 0xe5, 0x92, 0xc2, 0xfa, 0x38, 0x3d, 0x4a, 0x39, 0x60, 0x71, 0x4c, 0xae, 0xf0,
        0xc4, 0xf2,
    ];

    #[test]
    fn read_discard() {
        let mut reader = Cursor::new(b"foobar");
        reader.read_discard_exact(3).unwrap();

        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ba");

        let n = reader.read_discard(2).unwrap();
        assert_eq!(n, 1);

        assert_eq!(reader.stream_position().unwrap(), 6);
    }

    #[test]
    fn copy_functions() {
        let cancel_signal = AtomicBool::new(false);
        let mut reader = Cursor::new(b"foobar");
        let mut writer = Cursor::new([0u8; 6]);

        copy_n(&mut reader, &mut writer, 6, &cancel_signal).unwrap();
        assert_eq!(writer.get_ref(), b"foobar");

        // Reader early EOF.
        reader.seek(SeekFrom::Start(3)).unwrap();
        writer.rewind().unwrap();
        let err = copy_n(&mut reader, &mut writer, 6, &cancel_signal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        // Writer early EOF.
        reader.rewind().unwrap();
        writer.seek(SeekFrom::Start(3)).unwrap();
        let err = copy_n(&mut reader, &mut writer, 6, &cancel_signal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);

        reader.rewind().unwrap();
        writer.rewind().unwrap();
        let n = copy(&mut reader, &mut writer, &cancel_signal).unwrap();
        assert_eq!(n, 6);
        assert_eq!(writer.get_ref(), b"foobar");

        reader.rewind().unwrap();
        writer.rewind().unwrap();
        cancel_signal.store(true, Ordering::SeqCst);
        let err = copy_n(&mut reader, &mut writer, 6, &cancel_signal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        let err = copy(&mut reader, &mut writer, &cancel_signal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn copy_hashes_every_chunk() {
        let cancel_signal = AtomicBool::new(false);
        let reader = Cursor::new(b"foobar");
        let mut writer = Cursor::new([0u8; 6]);
        let mut context = Context::new(&ring::digest::SHA256);

        copy_n_inspect(reader, &mut writer, 6, |c| context.update(c), &cancel_signal).unwrap();

        assert_eq!(writer.get_ref(), b"foobar");
        assert_eq!(context.finish().as_ref(), FOOBAR_SHA256);
    }
}
