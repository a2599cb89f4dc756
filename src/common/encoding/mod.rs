mod varbit_ts;
mod varbit_xor;
mod varint;

/// Bit-granular cursor over a byte slice, as consumed by nom's bit parsers.
pub type NomBitInput<'a> = (&'a [u8], usize);

pub use varbit_ts::*;
pub use varbit_xor::*;
pub use varint::*;
