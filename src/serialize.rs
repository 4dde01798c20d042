//! Bit-packed serialization.
//!
//! Everything that touches the wire goes through the [`Stream`] trait: a
//! single user-authored serialize routine runs against [`WriteStream`],
//! [`ReadStream`] and [`MeasureStream`] and produces byte-identical wire
//! layouts in all modes. Values are passed as `&mut` so the same call site
//! reads a value out of the source in write mode and fills it in read mode.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

#[cfg(feature = "serialize_check")]
pub(crate) const SERIALIZE_CHECK_VALUE: u32 = 0x12345678;

/// Bits needed to represent any value in `[min, max]`.
///
/// Zero when `min == max` (the value is implied and nothing goes on the
/// wire).
pub fn bits_required(min: i32, max: i32) -> usize {
    debug_assert!(min <= max);
    if min == max {
        0
    } else {
        (32 - ((max.wrapping_sub(min)) as u32).leading_zeros()) as usize
    }
}

/// Why a serialize operation failed.
///
/// Write and measure streams only ever report [`StreamOverflow`]; the read
/// stream reports the rest when the inbound bytes violate the expected
/// layout. Nothing here panics: a malicious peer produces an `Err`, never
/// an abort.
///
/// [`StreamOverflow`]: SerializeError::StreamOverflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializeError {
    /// The operation would run past the end of the buffer.
    StreamOverflow,
    /// A read integer fell outside its declared `[min, max]` range.
    ValueOutOfRange,
    /// Alignment padding bits were nonzero on read.
    BadAlign,
    /// A serialize check sentinel did not match.
    CheckMismatch,
    /// A length-prefixed string held invalid bytes.
    BadString,
    /// A message type tag did not correspond to a known message type.
    UnknownMessageType,
    /// Packet data carried a block for a channel with blocks disabled.
    BlocksDisabled,
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            SerializeError::StreamOverflow => "serialize would pass the end of the stream",
            SerializeError::ValueOutOfRange => "value out of range",
            SerializeError::BadAlign => "nonzero alignment padding",
            SerializeError::CheckMismatch => "serialize check mismatch",
            SerializeError::BadString => "malformed string",
            SerializeError::UnknownMessageType => "unknown message type",
            SerializeError::BlocksDisabled => "block data on a channel with blocks disabled",
        };
        f.write_str(message)
    }
}

impl std::error::Error for SerializeError {}

/// Packs bits into a byte buffer, low bits first.
///
/// A 64-bit scratch accumulator fills from the low end; whenever 32 or more
/// bits are pending, the low 32 are emitted to the buffer as a little-endian
/// word. The buffer length must be a multiple of 4 so the final
/// [`flush`](BitWriter::flush) can always store a whole word.
pub struct BitWriter<'a> {
    data: &'a mut [u8],
    scratch: u64,
    scratch_bits: usize,
    word_index: usize,
    num_bits: usize,
    bits_written: usize,
}

impl<'a> BitWriter<'a> {
    pub fn new(data: &'a mut [u8]) -> BitWriter<'a> {
        assert!(
            data.len() % 4 == 0,
            "bit writer requires a buffer length that is a multiple of 4"
        );
        let num_bits = data.len() * 8;
        BitWriter {
            data,
            scratch: 0,
            scratch_bits: 0,
            word_index: 0,
            num_bits,
            bits_written: 0,
        }
    }

    /// Write the low `bits` bits of `value`. `value` must fit in `bits`.
    pub fn write_bits(&mut self, value: u32, bits: usize) -> Result<(), SerializeError> {
        debug_assert!(bits >= 1 && bits <= 32);
        debug_assert!(bits == 32 || (value >> bits) == 0);

        if self.bits_written + bits > self.num_bits {
            return Err(SerializeError::StreamOverflow);
        }

        self.scratch |= (value as u64) << self.scratch_bits;
        self.scratch_bits += bits;

        if self.scratch_bits >= 32 {
            LittleEndian::write_u32(&mut self.data[self.word_index * 4..], self.scratch as u32);
            self.scratch >>= 32;
            self.scratch_bits -= 32;
            self.word_index += 1;
        }

        self.bits_written += bits;
        Ok(())
    }

    /// Pad with zero bits up to the next byte boundary.
    pub fn write_align(&mut self) -> Result<(), SerializeError> {
        let remainder = self.bits_written % 8;
        if remainder != 0 {
            self.write_bits(0, 8 - remainder)?;
        }
        Ok(())
    }

    /// Write raw bytes. The writer must be byte-aligned.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SerializeError> {
        debug_assert!(self.bits_written % 8 == 0);
        for &byte in bytes {
            self.write_bits(byte as u32, 8)?;
        }
        Ok(())
    }

    /// Store any bits still pending in the scratch accumulator.
    ///
    /// Must be called once, after the final write and before the bytes are
    /// handed off.
    pub fn flush(&mut self) {
        if self.scratch_bits != 0 {
            LittleEndian::write_u32(&mut self.data[self.word_index * 4..], self.scratch as u32);
            self.scratch = 0;
            self.scratch_bits = 0;
            self.word_index += 1;
        }
    }

    pub fn bits_written(&self) -> usize {
        self.bits_written
    }

    pub fn bytes_written(&self) -> usize {
        (self.bits_written + 7) / 8
    }
}

/// Unpacks bits written by [`BitWriter`].
///
/// The input slice may have any length; the trailing partial word is
/// fetched zero-padded. Every read checks for overflow up front and fails
/// instead of reading past the end.
pub struct BitReader<'a> {
    data: &'a [u8],
    scratch: u64,
    scratch_bits: usize,
    word_index: usize,
    num_bits: usize,
    bits_read: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> BitReader<'a> {
        BitReader {
            data,
            scratch: 0,
            scratch_bits: 0,
            word_index: 0,
            num_bits: data.len() * 8,
            bits_read: 0,
        }
    }

    fn fetch_word(&mut self) -> u32 {
        let start = self.word_index * 4;
        let end = std::cmp::min(start + 4, self.data.len());
        let mut word = [0u8; 4];
        word[..end - start].copy_from_slice(&self.data[start..end]);
        self.word_index += 1;
        LittleEndian::read_u32(&word)
    }

    pub fn read_bits(&mut self, bits: usize) -> Result<u32, SerializeError> {
        debug_assert!(bits >= 1 && bits <= 32);

        if self.bits_read + bits > self.num_bits {
            return Err(SerializeError::StreamOverflow);
        }

        if self.scratch_bits < bits {
            let word = self.fetch_word();
            self.scratch |= (word as u64) << self.scratch_bits;
            self.scratch_bits += 32;
        }

        let value = (self.scratch & ((1u64 << bits) - 1)) as u32;
        self.scratch >>= bits;
        self.scratch_bits -= bits;
        self.bits_read += bits;
        Ok(value)
    }

    /// Skip padding up to the next byte boundary, failing if any padding
    /// bit is set.
    pub fn read_align(&mut self) -> Result<(), SerializeError> {
        let remainder = self.bits_read % 8;
        if remainder != 0 {
            let padding = self.read_bits(8 - remainder)?;
            if padding != 0 {
                return Err(SerializeError::BadAlign);
            }
        }
        Ok(())
    }

    /// Read raw bytes. The reader must be byte-aligned.
    pub fn read_bytes(&mut self, bytes: &mut [u8]) -> Result<(), SerializeError> {
        debug_assert!(self.bits_read % 8 == 0);
        for byte in bytes.iter_mut() {
            *byte = self.read_bits(8)? as u8;
        }
        Ok(())
    }

    pub fn bits_read(&self) -> usize {
        self.bits_read
    }
}

/// The uniform serialize interface.
///
/// Implementors provide the four primitives; everything else is derived so
/// that the derived layouts cannot diverge between modes. The const mode
/// flags let `if S::IS_READING` branches monomorphize away.
pub trait Stream {
    /// True when the stream fills values from a buffer.
    const IS_READING: bool;
    /// True when the stream produces wire data (writing or measuring).
    const IS_WRITING: bool;

    /// Serialize the low `bits` bits of `value`.
    fn serialize_bits(&mut self, value: &mut u32, bits: usize) -> Result<(), SerializeError>;

    /// Align to a byte boundary, then serialize raw bytes.
    fn serialize_bytes(&mut self, bytes: &mut [u8]) -> Result<(), SerializeError>;

    /// Align to a byte boundary with zero padding.
    fn serialize_align(&mut self) -> Result<(), SerializeError>;

    /// Bits consumed or produced so far.
    fn bits_processed(&self) -> usize;

    /// Serialize an integer known to lie in `[min, max]`, using
    /// `bits_required(min, max)` bits. Reading a value outside the range
    /// fails.
    fn serialize_int(&mut self, value: &mut i32, min: i32, max: i32) -> Result<(), SerializeError> {
        debug_assert!(min < max);
        let bits = bits_required(min, max);
        let mut unsigned = if Self::IS_READING {
            0
        } else {
            debug_assert!(*value >= min && *value <= max);
            value.wrapping_sub(min) as u32
        };
        self.serialize_bits(&mut unsigned, bits)?;
        if Self::IS_READING {
            let read = min.wrapping_add(unsigned as i32);
            if read < min || read > max {
                return Err(SerializeError::ValueOutOfRange);
            }
            *value = read;
        }
        Ok(())
    }

    fn serialize_bool(&mut self, value: &mut bool) -> Result<(), SerializeError> {
        let mut bits = if Self::IS_READING { 0 } else { *value as u32 };
        self.serialize_bits(&mut bits, 1)?;
        if Self::IS_READING {
            *value = bits != 0;
        }
        Ok(())
    }

    fn serialize_u16(&mut self, value: &mut u16) -> Result<(), SerializeError> {
        let mut bits = *value as u32;
        self.serialize_bits(&mut bits, 16)?;
        if Self::IS_READING {
            *value = bits as u16;
        }
        Ok(())
    }

    fn serialize_u32(&mut self, value: &mut u32) -> Result<(), SerializeError> {
        self.serialize_bits(value, 32)
    }

    fn serialize_u64(&mut self, value: &mut u64) -> Result<(), SerializeError> {
        let mut low = *value as u32;
        let mut high = (*value >> 32) as u32;
        self.serialize_bits(&mut low, 32)?;
        self.serialize_bits(&mut high, 32)?;
        if Self::IS_READING {
            *value = (low as u64) | ((high as u64) << 32);
        }
        Ok(())
    }

    fn serialize_float(&mut self, value: &mut f32) -> Result<(), SerializeError> {
        let mut bits = value.to_bits();
        self.serialize_bits(&mut bits, 32)?;
        if Self::IS_READING {
            *value = f32::from_bits(bits);
        }
        Ok(())
    }

    fn serialize_double(&mut self, value: &mut f64) -> Result<(), SerializeError> {
        let mut bits = value.to_bits();
        self.serialize_u64(&mut bits)?;
        if Self::IS_READING {
            *value = f64::from_bits(bits);
        }
        Ok(())
    }

    /// Length-prefixed, byte-aligned string of at most `max_bytes` bytes.
    fn serialize_string(
        &mut self,
        value: &mut String,
        max_bytes: usize,
    ) -> Result<(), SerializeError> {
        self.serialize_align()?;
        let mut length = value.len() as i32;
        debug_assert!(Self::IS_READING || value.len() <= max_bytes);
        self.serialize_int(&mut length, 0, max_bytes as i32)?;
        let mut bytes = if Self::IS_READING {
            vec![0u8; length as usize]
        } else {
            value.clone().into_bytes()
        };
        self.serialize_bytes(&mut bytes)?;
        if Self::IS_READING {
            *value = String::from_utf8(bytes).map_err(|_| SerializeError::BadString)?;
        }
        Ok(())
    }

    /// Byte-aligned 32-bit sentinel, used to catch read/write divergence.
    /// Compiles to nothing unless the `serialize_check` feature is enabled.
    fn serialize_check(&mut self) -> Result<(), SerializeError> {
        #[cfg(feature = "serialize_check")]
        {
            self.serialize_align()?;
            let mut value = SERIALIZE_CHECK_VALUE;
            self.serialize_bits(&mut value, 32)?;
            if Self::IS_READING && value != SERIALIZE_CHECK_VALUE {
                return Err(SerializeError::CheckMismatch);
            }
        }
        Ok(())
    }

    /// Serialize `current` as a variable-length positive delta from
    /// `previous` (`previous < current` on write).
    ///
    /// Cascaded encoding: one prefix bool per band, then the delta in
    /// 1 / 2 / 4 / 8 / 12 / 16 bits, falling back to the absolute value in
    /// 32 bits when the delta exceeds 69909.
    fn serialize_int_relative(
        &mut self,
        previous: i32,
        current: &mut i32,
    ) -> Result<(), SerializeError> {
        let mut difference = if Self::IS_WRITING {
            debug_assert!(previous < *current);
            *current - previous
        } else {
            0
        };

        let mut one_bit = Self::IS_WRITING && difference == 1;
        self.serialize_bool(&mut one_bit)?;
        if one_bit {
            if Self::IS_READING {
                *current = previous + 1;
            }
            return Ok(());
        }

        let mut two_bits = Self::IS_WRITING && difference <= 5;
        self.serialize_bool(&mut two_bits)?;
        if two_bits {
            self.serialize_int(&mut difference, 2, 5)?;
            if Self::IS_READING {
                *current = previous + difference;
            }
            return Ok(());
        }

        let mut four_bits = Self::IS_WRITING && difference <= 21;
        self.serialize_bool(&mut four_bits)?;
        if four_bits {
            self.serialize_int(&mut difference, 6, 21)?;
            if Self::IS_READING {
                *current = previous + difference;
            }
            return Ok(());
        }

        let mut eight_bits = Self::IS_WRITING && difference <= 277;
        self.serialize_bool(&mut eight_bits)?;
        if eight_bits {
            self.serialize_int(&mut difference, 22, 277)?;
            if Self::IS_READING {
                *current = previous + difference;
            }
            return Ok(());
        }

        let mut twelve_bits = Self::IS_WRITING && difference <= 4373;
        self.serialize_bool(&mut twelve_bits)?;
        if twelve_bits {
            self.serialize_int(&mut difference, 278, 4373)?;
            if Self::IS_READING {
                *current = previous + difference;
            }
            return Ok(());
        }

        let mut sixteen_bits = Self::IS_WRITING && difference <= 69909;
        self.serialize_bool(&mut sixteen_bits)?;
        if sixteen_bits {
            self.serialize_int(&mut difference, 4374, 69909)?;
            if Self::IS_READING {
                *current = previous + difference;
            }
            return Ok(());
        }

        let mut absolute = *current as u32;
        self.serialize_bits(&mut absolute, 32)?;
        if Self::IS_READING {
            *current = absolute as i32;
        }
        Ok(())
    }

    /// Serialize a 16-bit sequence as a delta from another 16-bit sequence,
    /// wrapping. `sequence2` must be ahead of `sequence1` in sequence space.
    fn serialize_sequence_relative(
        &mut self,
        sequence1: u16,
        sequence2: &mut u16,
    ) -> Result<(), SerializeError> {
        if Self::IS_WRITING {
            let previous = sequence1 as i32;
            let mut current =
                *sequence2 as i32 + if sequence1 > *sequence2 { 65536 } else { 0 };
            self.serialize_int_relative(previous, &mut current)?;
        } else {
            let previous = sequence1 as i32;
            let mut current = 0;
            self.serialize_int_relative(previous, &mut current)?;
            if current >= 65536 {
                current -= 65536;
            }
            *sequence2 = current as u16;
        }
        Ok(())
    }

    /// Serialize an ack id relative to the current sequence, favouring
    /// small deltas: deltas in `1..=64` cost 7 bits after a set in-range
    /// flag, anything else is a 16-bit absolute after a clear flag.
    fn serialize_ack_relative(
        &mut self,
        sequence: u16,
        ack: &mut u16,
    ) -> Result<(), SerializeError> {
        let mut ack_delta: i32 = 0;
        let mut ack_in_range = false;
        if Self::IS_WRITING {
            ack_delta = if *ack < sequence {
                (sequence - *ack) as i32
            } else {
                sequence as i32 + 65536 - *ack as i32
            };
            debug_assert!(ack_delta > 0);
            debug_assert_eq!(sequence.wrapping_sub(ack_delta as u16), *ack);
            ack_in_range = ack_delta <= 64;
        }
        self.serialize_bool(&mut ack_in_range)?;
        if ack_in_range {
            self.serialize_int(&mut ack_delta, 1, 64)?;
            if Self::IS_READING {
                *ack = sequence.wrapping_sub(ack_delta as u16);
            }
        } else {
            self.serialize_u16(ack)?;
        }
        Ok(())
    }
}

/// Serializes values out to a byte buffer.
pub struct WriteStream<'a> {
    writer: BitWriter<'a>,
}

impl<'a> WriteStream<'a> {
    pub fn new(data: &'a mut [u8]) -> WriteStream<'a> {
        WriteStream {
            writer: BitWriter::new(data),
        }
    }

    /// Flush pending bits and return the number of bytes produced.
    pub fn finish(mut self) -> usize {
        self.writer.flush();
        self.writer.bytes_written()
    }
}

impl Stream for WriteStream<'_> {
    const IS_READING: bool = false;
    const IS_WRITING: bool = true;

    fn serialize_bits(&mut self, value: &mut u32, bits: usize) -> Result<(), SerializeError> {
        self.writer.write_bits(*value, bits)
    }

    fn serialize_bytes(&mut self, bytes: &mut [u8]) -> Result<(), SerializeError> {
        self.writer.write_align()?;
        self.writer.write_bytes(bytes)
    }

    fn serialize_align(&mut self) -> Result<(), SerializeError> {
        self.writer.write_align()
    }

    fn bits_processed(&self) -> usize {
        self.writer.bits_written()
    }
}

/// Fills values from a byte buffer.
pub struct ReadStream<'a> {
    reader: BitReader<'a>,
}

impl<'a> ReadStream<'a> {
    pub fn new(data: &'a [u8]) -> ReadStream<'a> {
        ReadStream {
            reader: BitReader::new(data),
        }
    }
}

impl Stream for ReadStream<'_> {
    const IS_READING: bool = true;
    const IS_WRITING: bool = false;

    fn serialize_bits(&mut self, value: &mut u32, bits: usize) -> Result<(), SerializeError> {
        *value = self.reader.read_bits(bits)?;
        Ok(())
    }

    fn serialize_bytes(&mut self, bytes: &mut [u8]) -> Result<(), SerializeError> {
        self.reader.read_align()?;
        self.reader.read_bytes(bytes)
    }

    fn serialize_align(&mut self) -> Result<(), SerializeError> {
        self.reader.read_align()
    }

    fn bits_processed(&self) -> usize {
        self.reader.bits_read()
    }
}

/// Counts the bits a serialize routine would produce, without a buffer.
///
/// Alignment is measured at the worst case (7 bits) so measured sizes are
/// an upper bound usable for packet budgeting.
#[derive(Default)]
pub struct MeasureStream {
    bits: usize,
}

impl MeasureStream {
    pub fn new() -> MeasureStream {
        MeasureStream { bits: 0 }
    }
}

impl Stream for MeasureStream {
    const IS_READING: bool = false;
    const IS_WRITING: bool = true;

    fn serialize_bits(&mut self, _value: &mut u32, bits: usize) -> Result<(), SerializeError> {
        self.bits += bits;
        Ok(())
    }

    fn serialize_bytes(&mut self, bytes: &mut [u8]) -> Result<(), SerializeError> {
        self.serialize_align()?;
        self.bits += bytes.len() * 8;
        Ok(())
    }

    fn serialize_align(&mut self) -> Result<(), SerializeError> {
        self.bits += 7;
        Ok(())
    }

    fn bits_processed(&self) -> usize {
        self.bits
    }
}
