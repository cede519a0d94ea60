//! Variable-length unsigned integer encoding.
//!
//! Compact Bitcoin-style format: values below 0xFD occupy a single byte,
//! larger values are prefixed with 0xFD/0xFE/0xFF and written little-endian
//! as u16/u32/u64. Values above [`MAX_VAR_UINT`] are rejected on both the
//! write and the read path so encoded counts stay exact in every consumer,
//! including 53-bit float runtimes.

use crate::CodecError;

/// Largest value a var uint may carry (2^53 - 1).
pub const MAX_VAR_UINT: u64 = 9_007_199_254_740_991;

/// Append `value` to `out` in compact var uint form.
pub fn write_var_uint(out: &mut Vec<u8>, value: u64) -> Result<(), CodecError> {
    if value > MAX_VAR_UINT {
        return Err(CodecError::VarUintRange(value));
    }
    if value < 0xFD {
        out.push(value as u8);
    } else if value <= 0xFFFF {
        out.push(0xFD);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xFFFF_FFFF {
        out.push(0xFE);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(0xFF);
        out.extend_from_slice(&value.to_le_bytes());
    }
    Ok(())
}

/// Read a var uint from `buf` starting at `pos`, returning the value and the
/// number of bytes consumed.
pub fn read_var_uint(buf: &[u8], pos: usize) -> Result<(u64, usize), CodecError> {
    let marker = *buf
        .get(pos)
        .ok_or(CodecError::Truncated("var uint marker"))?;
    let (value, consumed) = match marker {
        0xFD => {
            let bytes = slice(buf, pos + 1, 2, "var uint u16")?;
            (u16::from_le_bytes([bytes[0], bytes[1]]) as u64, 3)
        }
        0xFE => {
            let bytes = slice(buf, pos + 1, 4, "var uint u32")?;
            (
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
                5,
            )
        }
        0xFF => {
            let bytes = slice(buf, pos + 1, 8, "var uint u64")?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            (u64::from_le_bytes(raw), 9)
        }
        small => (small as u64, 1),
    };
    if value > MAX_VAR_UINT {
        return Err(CodecError::VarUintRange(value));
    }
    Ok((value, consumed))
}

fn slice<'a>(
    buf: &'a [u8],
    start: usize,
    len: usize,
    what: &'static str,
) -> Result<&'a [u8], CodecError> {
    buf.get(start..start + len)
        .ok_or(CodecError::Truncated(what))
}
