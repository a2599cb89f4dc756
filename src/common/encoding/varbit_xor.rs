use bitstream_io::BitWrite;
use nom::bits::complete::{bool, take};
use nom::IResult;

use crate::common::encoding::NomBitInput;

/// Writes one f64 as the XOR against its predecessor.
///
/// Control bits: `0` for an identical value; `10` to reuse the previous
/// leading/trailing window; `11` followed by a 5-bit leading-zero count and a
/// 6-bit significant-bit count (0 standing for 64) to open a new window.
///
/// Pass `0xff` leading / `0` trailing for the first call of a stream. Returns
/// the window to carry into the next call.
pub fn write_varbit_xor<W: BitWrite>(
    value: f64,
    previous: f64,
    previous_leading: u8,
    previous_trailing: u8,
    writer: &mut W,
) -> std::io::Result<(u8, u8)> {
    let delta = value.to_bits() ^ previous.to_bits();

    if delta == 0 {
        writer.write_bit(false)?;
        return Ok((previous_leading, previous_trailing));
    }
    writer.write_bit(true)?;

    let mut leading = delta.leading_zeros() as u8;
    let trailing = delta.trailing_zeros() as u8;
    // The leading count has to fit the 5-bit field below.
    if leading >= 32 {
        leading = 31;
    }

    if previous_leading != 0xff && leading >= previous_leading && trailing >= previous_trailing {
        writer.write_bit(false)?;
        writer.write(
            64 - previous_leading as u32 - previous_trailing as u32,
            delta >> previous_trailing,
        )?;
        return Ok((previous_leading, previous_trailing));
    }

    writer.write_bit(true)?;
    writer.write_out::<5, u8>(leading)?;
    let sigbits = 64 - leading as u32 - trailing as u32;
    // 6 bits cannot hold 64; an all-significant value wraps to 0. Safe,
    // because 0 significant bits would have taken the identical-value path.
    writer.write_out::<6, u8>((sigbits & 0x3f) as u8)?;
    writer.write(sigbits, delta >> trailing)?;

    Ok((leading, trailing))
}

/// Reads one XOR-encoded f64. Pass 0 for both window counts on the first
/// call; thereafter feed back what the previous call returned.
pub fn read_varbit_xor<'a>(
    previous: f64,
    previous_leading: u8,
    previous_trailing: u8,
) -> impl Fn(NomBitInput<'a>) -> IResult<NomBitInput<'a>, (f64, u8, u8)> {
    move |input: NomBitInput<'a>| {
        let (rest, value_changed) = bool(input)?;
        if !value_changed {
            return Ok((rest, (previous, previous_leading, previous_trailing)));
        }

        let (rest, new_window) = bool(rest)?;
        let (rest, leading, trailing, sigbits) = if new_window {
            let (rest, leading): (_, u8) = take(5usize)(rest)?;
            let (rest, sigbits): (_, u8) = take(6usize)(rest)?;
            let sigbits = if sigbits == 0 { 64 } else { sigbits };
            // A corrupt stream can claim more than 64 bits; reject it here
            // rather than underflow.
            let Some(trailing) = 64u8.checked_sub(leading + sigbits) else {
                return Err(nom::Err::Error(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Verify,
                )));
            };
            (rest, leading, trailing, sigbits)
        } else {
            let sigbits = 64 - previous_leading - previous_trailing;
            (rest, previous_leading, previous_trailing, sigbits)
        };

        let (rest, bits): (_, u64) = take(sigbits)(rest)?;
        let value = f64::from_bits(previous.to_bits() ^ (bits << trailing));
        Ok((rest, (value, leading, trailing)))
    }
}
