use std::fmt::Display;

use get_size::GetSize;
use serde::{Deserialize, Serialize};

use crate::common::types::{Sample, Timestamp};
use crate::error::{VaultError, VaultResult};

mod pco_chunk;
mod xor;

pub use pco_chunk::{PcoChunkBuilder, PcoChunkReader};
pub use xor::{XorChunkBuilder, XorChunkReader};

/// How a chunk payload is encoded on the wire and in block artifacts.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[derive(GetSize)]
#[non_exhaustive]
pub enum ChunkEncoding {
    #[default]
    Xor = 1,
    Pco = 2,
}

impl ChunkEncoding {
    pub fn name(&self) -> &'static str {
        match self {
            ChunkEncoding::Xor => "xor",
            ChunkEncoding::Pco => "pco",
        }
    }

    pub fn to_u8(&self) -> u8 {
        *self as u8
    }
}

impl Display for ChunkEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl TryFrom<u8> for ChunkEncoding {
    type Error = VaultError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ChunkEncoding::Xor),
            2 => Ok(ChunkEncoding::Pco),
            _ => Err(VaultError::ChunkDecode(format!(
                "unknown encoding tag {value}"
            ))),
        }
    }
}

impl TryFrom<&str> for ChunkEncoding {
    type Error = VaultError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            s if s.eq_ignore_ascii_case("xor") => Ok(ChunkEncoding::Xor),
            s if s.eq_ignore_ascii_case("pco") => Ok(ChunkEncoding::Pco),
            _ => Err(VaultError::ChunkDecode(format!("unknown encoding {s:?}"))),
        }
    }
}

/// One immutable compressed run of samples, as shipped between endpoints and
/// stored inside block chunk artifacts.
///
/// `data` is empty in metadata-only responses (`skip_chunks`); the covered
/// range and sample count are always present.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[derive(GetSize)]
pub struct ChunkData {
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    pub num_samples: u32,
    pub encoding: ChunkEncoding,
    pub data: Vec<u8>,
}

impl ChunkData {
    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        self.min_time <= end && self.max_time >= start
    }

    pub fn is_metadata_only(&self) -> bool {
        self.data.is_empty() && self.num_samples > 0
    }

    /// The same chunk with the payload stripped, for `skip_chunks` replies.
    pub fn metadata_only(&self) -> ChunkData {
        ChunkData {
            min_time: self.min_time,
            max_time: self.max_time,
            num_samples: self.num_samples,
            encoding: self.encoding,
            data: Vec::new(),
        }
    }

    /// A fresh decoding pass over the payload. Can be called any number of
    /// times; the bytes are never consumed.
    pub fn iter(&self) -> VaultResult<SampleReader<'_>> {
        if self.is_metadata_only() {
            return Err(VaultError::ChunkDecode(
                "chunk carries metadata only, payload was skipped".to_string(),
            ));
        }
        match self.encoding {
            ChunkEncoding::Xor => Ok(SampleReader::Xor(XorChunkReader::new(
                &self.data,
                self.num_samples as usize,
            ))),
            ChunkEncoding::Pco => Ok(SampleReader::Pco(PcoChunkReader::new(
                &self.data,
                self.num_samples as usize,
            )?)),
        }
    }
}

/// Decoding iterator over one chunk payload.
#[derive(Debug)]
pub enum SampleReader<'a> {
    Xor(XorChunkReader<'a>),
    Pco(PcoChunkReader),
}

impl Iterator for SampleReader<'_> {
    type Item = VaultResult<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        use SampleReader::*;
        match self {
            Xor(reader) => reader.next(),
            Pco(reader) => reader.next(),
        }
    }
}

/// Encodes a sorted run of samples into a single sealed chunk.
pub fn encode_samples(samples: &[Sample], encoding: ChunkEncoding) -> VaultResult<ChunkData> {
    match encoding {
        ChunkEncoding::Xor => {
            let mut builder = XorChunkBuilder::new();
            for sample in samples {
                builder.append(sample)?;
            }
            builder.seal()
        }
        ChunkEncoding::Pco => {
            let mut builder = PcoChunkBuilder::new();
            for sample in samples {
                builder.append(sample)?;
            }
            builder.seal()
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::tests::generators::generate_samples;

    #[test]
    fn test_encoding_parse_battery() {
        assert_eq!(ChunkEncoding::try_from(1).unwrap(), ChunkEncoding::Xor);
        assert_eq!(ChunkEncoding::try_from(2).unwrap(), ChunkEncoding::Pco);
        assert!(ChunkEncoding::try_from(9).is_err());

        assert_eq!(ChunkEncoding::try_from("XOR").unwrap(), ChunkEncoding::Xor);
        assert_eq!(ChunkEncoding::try_from("pco").unwrap(), ChunkEncoding::Pco);
        assert!(ChunkEncoding::try_from("gzip").is_err());

        assert_eq!(ChunkEncoding::Xor.to_string(), "xor");
        assert_eq!(ChunkEncoding::Pco.to_u8(), 2);
    }

    #[test_case(ChunkEncoding::Xor)]
    #[test_case(ChunkEncoding::Pco)]
    fn test_encode_round_trip(encoding: ChunkEncoding) {
        let samples = generate_samples(7, 500, 1000, 15_000);
        let chunk = encode_samples(&samples, encoding).unwrap();

        assert_eq!(chunk.num_samples as usize, samples.len());
        assert_eq!(chunk.min_time, samples[0].timestamp);
        assert_eq!(chunk.max_time, samples.last().unwrap().timestamp);

        let decoded: Vec<Sample> = chunk.iter().unwrap().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, samples);

        // restartable: a second pass sees the same data
        let decoded_again: Vec<Sample> = chunk.iter().unwrap().map(|s| s.unwrap()).collect();
        assert_eq!(decoded_again, samples);
    }

    #[test]
    fn test_metadata_only_rejects_decoding() {
        let samples = generate_samples(7, 10, 1000, 15_000);
        let chunk = encode_samples(&samples, ChunkEncoding::Xor).unwrap();
        let meta = chunk.metadata_only();

        assert!(meta.is_metadata_only());
        assert_eq!(meta.min_time, chunk.min_time);
        assert_eq!(meta.max_time, chunk.max_time);
        assert_eq!(meta.num_samples, chunk.num_samples);
        assert!(meta.iter().is_err());
    }

    #[test]
    fn test_overlaps() {
        let samples = generate_samples(7, 10, 1000, 15_000);
        let chunk = encode_samples(&samples, ChunkEncoding::Xor).unwrap();
        assert!(chunk.overlaps(chunk.min_time, chunk.max_time));
        assert!(chunk.overlaps(chunk.max_time, i64::MAX));
        assert!(!chunk.overlaps(chunk.max_time + 1, i64::MAX));
        assert!(!chunk.overlaps(i64::MIN, chunk.min_time - 1));
    }
}
