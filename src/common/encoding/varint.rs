use nom::bytes::complete::take;
use nom::IResult;

/// Writes a u64 in LEB128 form, low groups first, high bit as continuation.
pub fn write_uvarint<W: std::io::Write>(value: u64, writer: &mut W) -> std::io::Result<()> {
    let mut x = value;
    while x >= 0x80 {
        writer.write_all(&[0x80 | (x as u8)])?;
        x >>= 7;
    }
    writer.write_all(&[x as u8])
}

/// Reads a LEB128-encoded u64. At most ten bytes are consumed; a longer run,
/// or a tenth byte carrying more than one bit, overflows and is rejected.
pub fn read_uvarint(input: &[u8]) -> IResult<&[u8], u64> {
    let overflow = || {
        nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::TooLarge,
        ))
    };

    let mut rest = input;
    let mut x: u64 = 0;
    let mut shift = 0usize;
    for i in 0..10 {
        let (new_rest, byte) = take(1usize)(rest)?;
        rest = new_rest;
        let byte = byte[0];
        if byte < 0x80 {
            if i == 9 && byte > 1 {
                return Err(overflow());
            }
            return Ok((rest, x | (byte as u64) << shift));
        }
        x |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }
    Err(overflow())
}

/// Writes an i64 zigzag-mapped onto the uvarint encoding, so small negative
/// numbers stay short.
pub fn write_varint<W: std::io::Write>(value: i64, writer: &mut W) -> std::io::Result<()> {
    let mut ux = (value as u64) << 1;
    if value < 0 {
        ux = !ux;
    }
    write_uvarint(ux, writer)
}

/// Reads a zigzag-encoded i64.
pub fn read_varint(input: &[u8]) -> IResult<&[u8], i64> {
    let (rest, ux) = read_uvarint(input)?;
    let value = (ux >> 1) as i64;
    if ux & 1 != 0 {
        Ok((rest, !value))
    } else {
        Ok((rest, value))
    }
}
