use bitstream_io::BitWrite;
use nom::bits::complete::{bool, take};
use nom::IResult;

use crate::common::encoding::NomBitInput;

/// Writes a timestamp delta-of-delta in the varbit scheme used inside chunks.
///
/// A unary bucket prefix selects the payload width: `0` for zero, `10` for
/// 14 bits, `110` for 17, `1110` for 20, `1111` for a full 64. Payloads are
/// the low bits of the two's-complement value.
pub fn write_varbit_ts<W: BitWrite>(value: i64, writer: &mut W) -> std::io::Result<()> {
    match value {
        0 => writer.write_bit(false)?,
        -8191..=8192 => {
            writer.write_out::<2, u8>(0b10)?;
            writer.write_out::<14, u64>(value as u64 & 0x3FFF)?;
        }
        -65535..=65536 => {
            writer.write_out::<3, u8>(0b110)?;
            writer.write_out::<17, u64>(value as u64 & 0x1_FFFF)?;
        }
        -524287..=524288 => {
            writer.write_out::<4, u8>(0b1110)?;
            writer.write_out::<20, u64>(value as u64 & 0xF_FFFF)?;
        }
        _ => {
            writer.write_out::<4, u8>(0b1111)?;
            writer.write_out::<64, u64>(value as u64)?;
        }
    }
    Ok(())
}

/// Reads the unary bucket prefix: the number of leading 1 bits, capped at 4,
/// with the terminating 0 consumed for the short buckets.
fn read_bucket(input: NomBitInput) -> IResult<NomBitInput, u8> {
    let mut rest = input;
    for count in 0..4 {
        let (new_rest, bit) = bool(rest)?;
        rest = new_rest;
        if !bit {
            return Ok((rest, count));
        }
    }
    Ok((rest, 4))
}

fn bucket_bits(bucket: u8) -> u8 {
    match bucket {
        0 => 0,
        1 => 14,
        2 => 17,
        3 => 20,
        _ => 64,
    }
}

/// Reads one varbit-encoded timestamp delta-of-delta.
pub fn read_varbit_ts(input: NomBitInput) -> IResult<NomBitInput, i64> {
    let (rest, bucket) = read_bucket(input)?;
    if bucket == 0 {
        return Ok((rest, 0));
    }

    let num_bits = bucket_bits(bucket);
    let (rest, mut value): (_, i64) = take(num_bits)(rest)?;
    // Sign extension: payloads are stored as the low num_bits of the value.
    if num_bits != 64 && value > (1 << (num_bits - 1)) {
        value -= 1 << num_bits;
    }
    Ok((rest, value))
}
