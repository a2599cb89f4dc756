use bitstream_io::{BigEndian, BitWrite, BitWriter};
use nom::number::complete::be_f64;
use nom::sequence::tuple;
use smallvec::SmallVec;

use crate::common::encoding::{
    read_uvarint, read_varbit_ts, read_varbit_xor, read_varint, write_uvarint, write_varbit_ts,
    write_varbit_xor, write_varint, NomBitInput,
};
use crate::common::types::{Sample, Timestamp};
use crate::error::{VaultError, VaultResult};

use super::{ChunkData, ChunkEncoding};

/// Streaming XOR chunk encoder.
///
/// First sample: varint timestamp plus the raw f64. Second: uvarint timestamp
/// delta plus an XOR-encoded value. Every following sample: varbit
/// delta-of-delta plus an XOR-encoded value. `seal` pads to a byte boundary;
/// the sample count lives next to the payload, so the padding never decodes
/// as data.
pub struct XorChunkBuilder {
    writer: BitWriter<Vec<u8>, BigEndian>,
    num_samples: usize,
    first_timestamp: Timestamp,
    timestamp: Timestamp,
    value: f64,
    leading: u8,
    trailing: u8,
    timestamp_delta: i64,
}

impl Default for XorChunkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl XorChunkBuilder {
    pub fn new() -> XorChunkBuilder {
        XorChunkBuilder {
            writer: BitWriter::endian(Vec::new(), BigEndian),
            num_samples: 0,
            first_timestamp: 0,
            timestamp: 0,
            value: 0.0,
            leading: 0,
            trailing: 0,
            timestamp_delta: 0,
        }
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    pub fn append(&mut self, sample: &Sample) -> VaultResult<()> {
        match self.num_samples {
            0 => self.write_first(sample),
            1 => self.write_second(sample),
            _ => self.write_nth(sample),
        }
    }

    fn delta_from_last(&self, sample: &Sample) -> VaultResult<i64> {
        let delta = sample.timestamp - self.timestamp;
        if delta < 0 {
            return Err(VaultError::OutOfOrderSample(
                sample.timestamp,
                self.timestamp,
            ));
        }
        Ok(delta)
    }

    fn write_first(&mut self, sample: &Sample) -> VaultResult<()> {
        let mut scratch = SmallVec::<u8, 9>::new();
        write_varint(sample.timestamp, &mut scratch)?;
        self.writer.write_bytes(&scratch)?;
        self.writer.write_bytes(&sample.value.to_be_bytes())?;

        self.first_timestamp = sample.timestamp;
        self.timestamp = sample.timestamp;
        self.value = sample.value;
        self.num_samples = 1;
        Ok(())
    }

    fn write_second(&mut self, sample: &Sample) -> VaultResult<()> {
        let delta = self.delta_from_last(sample)?;

        // The writer is still byte aligned here, so the uvarint can go in as
        // whole bytes.
        let mut scratch = SmallVec::<u8, 9>::new();
        write_uvarint(delta as u64, &mut scratch)?;
        self.writer.write_bytes(&scratch)?;

        let (leading, trailing) =
            write_varbit_xor(sample.value, self.value, 0xff, 0, &mut self.writer)?;

        self.timestamp = sample.timestamp;
        self.value = sample.value;
        self.leading = leading;
        self.trailing = trailing;
        self.timestamp_delta = delta;
        self.num_samples = 2;
        Ok(())
    }

    fn write_nth(&mut self, sample: &Sample) -> VaultResult<()> {
        let delta = self.delta_from_last(sample)?;
        let delta_of_delta = delta - self.timestamp_delta;

        write_varbit_ts(delta_of_delta, &mut self.writer)?;
        let (leading, trailing) = write_varbit_xor(
            sample.value,
            self.value,
            self.leading,
            self.trailing,
            &mut self.writer,
        )?;

        self.timestamp = sample.timestamp;
        self.value = sample.value;
        self.leading = leading;
        self.trailing = trailing;
        self.timestamp_delta = delta;
        self.num_samples += 1;
        Ok(())
    }

    pub fn seal(mut self) -> VaultResult<ChunkData> {
        if self.num_samples == 0 {
            return Err(VaultError::EmptyChunk);
        }
        self.writer.byte_align()?;
        let data = self.writer.into_writer();
        Ok(ChunkData {
            min_time: self.first_timestamp,
            max_time: self.timestamp,
            num_samples: self.num_samples as u32,
            encoding: ChunkEncoding::Xor,
            data,
        })
    }
}

/// Decoder over a sealed XOR payload. Each call to [`ChunkData::iter`] makes
/// a fresh one; the payload bytes are borrowed, never consumed.
#[derive(Debug)]
pub struct XorChunkReader<'a> {
    cursor: NomBitInput<'a>,
    idx: usize,
    num_samples: usize,
    timestamp: Timestamp,
    value: f64,
    leading: u8,
    trailing: u8,
    timestamp_delta: i64,
}

impl<'a> XorChunkReader<'a> {
    pub fn new(data: &'a [u8], num_samples: usize) -> XorChunkReader<'a> {
        XorChunkReader {
            cursor: (data, 0),
            idx: 0,
            num_samples,
            timestamp: 0,
            value: 0.0,
            leading: 0,
            trailing: 0,
            timestamp_delta: 0,
        }
    }

    fn decode_err(&self, what: &str) -> VaultError {
        VaultError::ChunkDecode(format!("xor payload truncated or corrupt at {what}"))
    }

    fn read_first(&mut self) -> VaultResult<Sample> {
        let (rest, (timestamp, value)) = tuple((read_varint, be_f64))(self.cursor.0)
            .map_err(|_| self.decode_err("first sample"))?;
        self.cursor = (rest, 0);
        self.timestamp = timestamp;
        self.value = value;
        Ok(Sample { timestamp, value })
    }

    fn read_second(&mut self) -> VaultResult<Sample> {
        // Mirrors the writer: the delta was written on a byte boundary.
        debug_assert_eq!(self.cursor.1, 0);
        let (rest, delta) =
            read_uvarint(self.cursor.0).map_err(|_| self.decode_err("timestamp delta"))?;
        let delta =
            i64::try_from(delta).map_err(|_| self.decode_err("oversized timestamp delta"))?;

        let (cursor, (value, leading, trailing)) =
            read_varbit_xor(self.value, self.leading, self.trailing)((rest, 0))
                .map_err(|_| self.decode_err("second value"))?;

        self.cursor = cursor;
        self.timestamp += delta;
        self.timestamp_delta = delta;
        self.value = value;
        self.leading = leading;
        self.trailing = trailing;
        Ok(Sample {
            timestamp: self.timestamp,
            value,
        })
    }

    fn read_nth(&mut self) -> VaultResult<Sample> {
        let (cursor, (delta_of_delta, (value, leading, trailing))) = tuple((
            read_varbit_ts,
            read_varbit_xor(self.value, self.leading, self.trailing),
        ))(self.cursor)
        .map_err(|_| self.decode_err("sample"))?;

        let delta = self.timestamp_delta + delta_of_delta;
        if delta < 0 {
            return Err(self.decode_err("negative timestamp delta"));
        }

        self.cursor = cursor;
        self.timestamp_delta = delta;
        self.timestamp += delta;
        self.value = value;
        self.leading = leading;
        self.trailing = trailing;
        Ok(Sample {
            timestamp: self.timestamp,
            value,
        })
    }
}

impl Iterator for XorChunkReader<'_> {
    type Item = VaultResult<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.num_samples {
            return None;
        }
        let result = match self.idx {
            0 => self.read_first(),
            1 => self.read_second(),
            _ => self.read_nth(),
        };
        self.idx += 1;
        Some(result)
    }
}
