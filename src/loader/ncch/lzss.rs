//! Backwards LZSS used to compress the ExeFS `.code` section.
//!
//! The stream is decoded from its end towards its start. Its last eight bytes
//! are a footer: the low 24 bits of the first word give the length of the
//! compressed region measured from the end of the buffer, the top byte the
//! length of the footer itself, and the second word how much larger the output
//! is than the input.

use crate::{LoaderError, LoaderResult};

const BAD: LoaderError = LoaderError::InvalidFormat("compressed code");
/// A control byte and eight 2-byte references expand to at most 144 bytes,
/// so no valid stream grows by more than this factor
const MAX_GROWTH: usize = 8;

pub fn decompressed_size(compressed: &[u8]) -> Option<usize> {
    let footer = compressed.len().checked_sub(4)?;
    let extra = u32::from_le_bytes(compressed[footer..].try_into().ok()?);
    Some(compressed.len() + extra as usize)
}

pub fn decompress(compressed: &[u8]) -> LoaderResult<Vec<u8>> {
    let len = compressed.len();
    if len < 8 {
        return Err(BAD);
    }
    let size = decompressed_size(compressed).ok_or(BAD)?;
    if size - len > len * MAX_GROWTH {
        return Err(BAD);
    }
    let top_and_bottom = u32::from_le_bytes(compressed[len - 8..len - 4].try_into().map_err(|_| BAD)?);

    let mut index = len.checked_sub((top_and_bottom >> 24) as usize).ok_or(BAD)?;
    let stop_index = len.checked_sub((top_and_bottom & 0xFF_FFFF) as usize).ok_or(BAD)?;
    let mut out = size;

    let mut buf = vec![0u8; size];
    buf[..len].copy_from_slice(compressed);

    while index > stop_index {
        index -= 1;
        let mut control = compressed[index];

        for _ in 0..8 {
            if index <= stop_index || out == 0 {
                break;
            }

            if control & 0x80 != 0 {
                if index < 2 {
                    return Err(BAD);
                }
                index -= 2;
                let pair = u16::from_le_bytes([compressed[index], compressed[index + 1]]) as usize;
                let segment_size = ((pair >> 12) & 0xF) + 3;
                let segment_offset = (pair & 0x0FFF) + 2;

                if out < segment_size {
                    return Err(BAD);
                }
                for _ in 0..segment_size {
                    let src = out + segment_offset;
                    if src >= size {
                        return Err(BAD);
                    }
                    out -= 1;
                    buf[out] = buf[src];
                }
            } else {
                index -= 1;
                out -= 1;
                buf[out] = compressed[index];
            }

            control <<= 1;
        }
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    // three literals followed by a three byte back reference, no size growth
    const SAMPLE: [u8; 14] = [
        0x00, 0x00, b'A', b'B', b'C', 0x10,
        0x0E, 0x00, 0x00, 0x08,
        0x00, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn expands_literals_and_back_references() {
        let out = decompress(&SAMPLE).unwrap();
        assert_eq!(
            out,
            [0x00, 0x00, b'A', b'B', b'C', 0x10, 0x0E, 0x00, b'A', b'B', b'C', b'A', b'B', b'C']
        );
    }

    #[test]
    fn output_grows_by_footer_amount() {
        let mut grown = SAMPLE;
        grown[10] = 4;
        assert_eq!(decompressed_size(&grown), Some(18));
        let out = decompress(&grown).unwrap();
        assert_eq!(out.len(), 18);
        assert_eq!(&out[12..], b"ABCABC");
    }

    #[test]
    fn rejects_short_or_inconsistent_input() {
        assert!(matches!(decompress(&[0; 7]), Err(LoaderError::InvalidFormat(_))));

        // compressed region claims to be longer than the buffer
        let mut bad = SAMPLE;
        bad[6] = 0xFF;
        assert!(decompress(&bad).is_err());

        // growth no real stream can produce
        let mut bad = SAMPLE;
        bad[10..].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(decompress(&bad), Err(LoaderError::InvalidFormat(_))));

        // back reference reaching past the end of the output
        let mut bad = SAMPLE;
        bad[5] = 0x80;
        assert!(decompress(&bad).is_err());
    }
}
