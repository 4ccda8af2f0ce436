use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use bincode::Options;

/// bincode settings matching the in-memory layout of the kernel structs:
/// fixed-width integers in native byte order, no length prefixes.
#[inline]
pub fn get_bincode_config() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_native_endian()
        .allow_trailing_bytes()
}

/// Split a NUL terminated name off the front of `data`.
///
/// Returns the name (without terminator) and the bytes after it.
pub fn split_name(data: &[u8]) -> Option<(&OsStr, &[u8])> {
    let nul = data.iter().position(|b| *b == 0)?;
    Some((OsStr::from_bytes(&data[..nul]), &data[nul + 1..]))
}

/// Round `len` up to the next multiple of 8, the alignment of directory records.
#[inline]
pub const fn align8(len: usize) -> usize {
    (len + 7) & !7
}
