//! Little-endian readers and offset arithmetic shared by the container parsers.

use std::io::{self, Read, Seek, SeekFrom};

/// Size of one media unit, the addressing granule of NCCH and NCSD offsets
pub(crate) const MEDIA_UNIT: u64 = 0x200;

pub(crate) fn align(what: u64, alignment: u64) -> u64 {
    if what % alignment != 0 {
        what + (alignment - what % alignment)
    } else {
        what
    }
}

pub(crate) fn u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let [b] = bytes::<1>(r)?;
    Ok(b)
}

pub(crate) fn le_u16<R: Read>(r: &mut R) -> io::Result<u16> {
    Ok(u16::from_le_bytes(bytes(r)?))
}

pub(crate) fn le_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(bytes(r)?))
}

pub(crate) fn le_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    Ok(u64::from_le_bytes(bytes(r)?))
}

pub(crate) fn bytes<const N: usize>(r: &mut impl Read) -> io::Result<[u8; N]> {
    let mut b = [0u8; N];
    r.read_exact(&mut b)?;
    Ok(b)
}

/// Reads exactly `len` bytes. The buffer only grows with the data actually
/// read, so a bogus length from a header ends in `UnexpectedEof`.
pub(crate) fn bytes_vec<R: Read>(r: &mut R, len: u64) -> io::Result<Vec<u8>> {
    let mut b = Vec::new();
    r.take(len).read_to_end(&mut b)?;
    if (b.len() as u64) < len {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(b)
}

/// Reads the four bytes at `offset` and compares them against `magic`.
/// A short read counts as a mismatch.
pub(crate) fn magic_at<R: Read + Seek>(r: &mut R, offset: u64, magic: &[u8; 4]) -> io::Result<bool> {
    r.seek(SeekFrom::Start(offset))?;
    match bytes::<4>(r) {
        Ok(got) => Ok(&got == magic),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Runs `f` with the cursor at the start of the stream and puts it back there
/// afterwards, whatever `f` returned.
pub(crate) fn probe<R, T, F>(r: &mut R, f: F) -> io::Result<T>
where
    R: Seek,
    F: FnOnce(&mut R) -> io::Result<T>,
{
    r.seek(SeekFrom::Start(0))?;
    let ret = f(r);
    r.seek(SeekFrom::Start(0))?;
    ret
}
