//! Bit-level access to big-endian register buffers.
//!
//! Bit indices count from the least significant bit of the register value.
//! Because registers are transmitted big-endian, bits 0-7 live in the *last*
//! byte of the buffer, bits 8-15 in the second to last byte and so on.

use crate::{Error, Result};

fn check_span(buffer: &[u8], bit_index: usize, count: usize) -> Result<()> {
    if bit_index + count > buffer.len() * 8 {
        return Err(Error::BitIndexOutOfRange {
            bit_index,
            count,
            buffer_len: buffer.len(),
        });
    }
    Ok(())
}

/// Maps a bit index to `(byte index, bit within byte)`.
fn locate(buffer_len: usize, bit_index: usize) -> (usize, usize) {
    (buffer_len - 1 - bit_index / 8, bit_index % 8)
}

/// Returns a copy of `buffer` where `bits[i]` has been written to bit position
/// `start_bit + i`. All other bits are preserved.
///
/// # Errors
///
/// [`Error::BitIndexOutOfRange`] if `start_bit + bits.len()` exceeds the buffer.
pub fn set_bits(buffer: &[u8], bits: &[bool], start_bit: usize) -> Result<Vec<u8>> {
    check_span(buffer, start_bit, bits.len())?;
    let mut out = buffer.to_vec();
    for (offset, bit) in bits.iter().enumerate() {
        let (byte, shift) = locate(out.len(), start_bit + offset);
        if *bit {
            out[byte] |= 1 << shift;
        } else {
            out[byte] &= !(1 << shift);
        }
    }
    Ok(out)
}

/// Writes the `width` low bits of `value` into the field starting at `start_bit`.
pub fn set_field(buffer: &[u8], value: u64, start_bit: usize, width: usize) -> Result<Vec<u8>> {
    if width < 64 && value >> width != 0 {
        return Err(Error::InvalidValue(format!(
            "{value} does not fit into a {width} bit field"
        )));
    }
    let bits: Vec<bool> = (0..width).map(|i| value >> i & 1 == 1).collect();
    set_bits(buffer, &bits, start_bit)
}

/// Reads an unsigned field of `width` bits starting at `start_bit`.
pub fn get_field(buffer: &[u8], start_bit: usize, width: usize) -> Result<u64> {
    check_span(buffer, start_bit, width)?;
    let mut value = 0u64;
    for offset in (0..width.min(64)).rev() {
        let (byte, shift) = locate(buffer.len(), start_bit + offset);
        value = value << 1 | u64::from(buffer[byte] >> shift & 1);
    }
    Ok(value)
}

/// Reads a single flag.
pub fn get_bit(buffer: &[u8], bit_index: usize) -> Result<bool> {
    Ok(get_field(buffer, bit_index, 1)? == 1)
}
