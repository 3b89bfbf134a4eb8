//! Bounded, endian-aware readers over debug section data.

use crate::error::{DwarfError, DwarfErrorKind};

/// Byte order of a section view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

/// The parameters that determine how values in a section are read.
///
/// `address_size` comes from the ELF class (or the unit header once one has
/// been decoded), `offset_size` from the DWARF initial-length escape: 4 for
/// 32-bit DWARF and 8 for 64-bit DWARF.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Encoding {
    /// Byte order of the data.
    pub endian: Endian,
    /// Size in bytes of an address-sized value (4 or 8).
    pub address_size: u8,
    /// Size in bytes of an offset-sized value (4 or 8).
    pub offset_size: u8,
}

impl Encoding {
    /// Creates an encoding with 32-bit DWARF offsets.
    pub fn new(endian: Endian, address_size: u8) -> Self {
        Encoding {
            endian,
            address_size,
            offset_size: 4,
        }
    }
}

/// A positioned cursor over one section view.
///
/// All reads are bounds-checked against the view; running off the end
/// yields [`DwarfErrorKind::Truncated`]. Readers are cheap values; taking a
/// copy snapshots the position.
#[derive(Clone, Copy, Debug)]
pub struct SectionReader<'data> {
    data: &'data [u8],
    pos: usize,
    encoding: Encoding,
}

impl<'data> SectionReader<'data> {
    /// Creates a reader over a section view, positioned at its start.
    pub fn new(data: &'data [u8], encoding: Encoding) -> Self {
        SectionReader {
            data,
            pos: 0,
            encoding,
        }
    }

    /// Creates a reader positioned at the given offset.
    pub fn at(data: &'data [u8], encoding: Encoding, pos: usize) -> Result<Self, DwarfError> {
        if pos > data.len() {
            return Err(DwarfErrorKind::Truncated.into());
        }
        Ok(SectionReader {
            data,
            pos,
            encoding,
        })
    }

    /// The encoding this reader applies.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Replaces the encoding, keeping data and position.
    pub fn set_encoding(&mut self, encoding: Encoding) {
        self.encoding = encoding;
    }

    /// The current byte position within the section.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Repositions the reader.
    pub fn set_pos(&mut self, pos: usize) -> Result<(), DwarfError> {
        if pos > self.data.len() {
            return Err(DwarfErrorKind::Truncated.into());
        }
        self.pos = pos;
        Ok(())
    }

    /// The full section data this reader operates on.
    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    /// The number of bytes left before the end of the view.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Whether the reader is at the end of the view.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Reads `len` raw bytes and advances.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'data [u8], DwarfError> {
        if self.remaining() < len {
            return Err(DwarfErrorKind::Truncated.into());
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Skips `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<(), DwarfError> {
        self.read_bytes(len).map(|_| ())
    }

    /// Reads a null-terminated byte string, excluding the terminator.
    pub fn read_cstr(&mut self) -> Result<&'data [u8], DwarfError> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&byte| byte == 0)
            .ok_or(DwarfErrorKind::Truncated)?;
        let bytes = &rest[..nul];
        self.pos += nul + 1;
        Ok(bytes)
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8, DwarfError> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Reads a 16-bit unsigned value in the view's byte order.
    pub fn read_u16(&mut self) -> Result<u16, DwarfError> {
        let bytes: [u8; 2] = self.read_bytes(2)?.try_into().unwrap();
        Ok(match self.encoding.endian {
            Endian::Little => u16::from_le_bytes(bytes),
            Endian::Big => u16::from_be_bytes(bytes),
        })
    }

    /// Reads a 32-bit unsigned value in the view's byte order.
    pub fn read_u32(&mut self) -> Result<u32, DwarfError> {
        let bytes: [u8; 4] = self.read_bytes(4)?.try_into().unwrap();
        Ok(match self.encoding.endian {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        })
    }

    /// Reads a 64-bit unsigned value in the view's byte order.
    pub fn read_u64(&mut self) -> Result<u64, DwarfError> {
        let bytes: [u8; 8] = self.read_bytes(8)?.try_into().unwrap();
        Ok(match self.encoding.endian {
            Endian::Little => u64::from_le_bytes(bytes),
            Endian::Big => u64::from_be_bytes(bytes),
        })
    }

    /// Reads a 32-bit signed value in the view's byte order.
    pub fn read_i32(&mut self) -> Result<i32, DwarfError> {
        self.read_u32().map(|value| value as i32)
    }

    /// Reads a 64-bit signed value in the view's byte order.
    pub fn read_i64(&mut self) -> Result<i64, DwarfError> {
        self.read_u64().map(|value| value as i64)
    }

    /// Reads an unsigned value of the given byte width (1, 2, 4 or 8).
    pub fn read_word(&mut self, width: u8) -> Result<u64, DwarfError> {
        match width {
            1 => self.read_u8().map(u64::from),
            2 => self.read_u16().map(u64::from),
            4 => self.read_u32().map(u64::from),
            8 => self.read_u64(),
            _ => Err(DwarfErrorKind::InvalidDwarf.into()),
        }
    }

    /// Reads an address-sized value per the view's `address_size`.
    pub fn read_address(&mut self) -> Result<u64, DwarfError> {
        self.read_word(self.encoding.address_size)
    }

    /// Reads an offset-sized value per the view's `offset_size`.
    pub fn read_offset(&mut self) -> Result<u64, DwarfError> {
        self.read_word(self.encoding.offset_size)
    }

    /// Reads an unsigned LEB128 value.
    ///
    /// Each continuation byte contributes seven bits. A sequence longer
    /// than ten bytes cannot fit the 64-bit accumulator and fails with
    /// [`DwarfErrorKind::Overflow`].
    pub fn read_uleb128(&mut self) -> Result<u64, DwarfError> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 70 {
                return Err(DwarfErrorKind::Overflow.into());
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Reads a signed LEB128 value.
    pub fn read_sleb128(&mut self) -> Result<i64, DwarfError> {
        let mut result = 0i64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 70 {
                return Err(DwarfErrorKind::Overflow.into());
            }
            result |= i64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// Reads a DWARF initial length, updating the reader's offset size.
    ///
    /// A 32-bit length of `0xffff_ffff` escapes into 64-bit DWARF with an
    /// 8-byte length following; the reserved range below it is rejected.
    pub fn read_initial_length(&mut self) -> Result<u64, DwarfError> {
        let length = self.read_u32()?;
        if length == 0xffff_ffff {
            self.encoding.offset_size = 8;
            self.read_u64()
        } else if length >= 0xffff_fff0 {
            Err(DwarfErrorKind::InvalidDwarf.into())
        } else {
            self.encoding.offset_size = 4;
            Ok(u64::from(length))
        }
    }

    /// Returns a sub-reader over `len` bytes starting at the current
    /// position, and advances past them.
    pub fn split(&mut self, len: usize) -> Result<SectionReader<'data>, DwarfError> {
        let encoding = self.encoding;
        let bytes = self.read_bytes(len)?;
        Ok(SectionReader::new(bytes, encoding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use similar_asserts::assert_eq;

    const LE32: Encoding = Encoding {
        endian: Endian::Little,
        address_size: 4,
        offset_size: 4,
    };

    const BE64: Encoding = Encoding {
        endian: Endian::Big,
        address_size: 8,
        offset_size: 4,
    };

    fn encode_uleb128(mut value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                return out;
            }
        }
    }

    fn encode_sleb128(mut value: i64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let sign = byte & 0x40 != 0;
            if (value == 0 && !sign) || (value == -1 && sign) {
                out.push(byte);
                return out;
            }
            out.push(byte | 0x80);
        }
    }

    #[test]
    fn test_fixed_width_endian() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let mut le = SectionReader::new(&data, LE32);
        assert_eq!(le.read_u32().unwrap(), 0x0403_0201);

        let mut be = SectionReader::new(&data, BE64);
        assert_eq!(be.read_u32().unwrap(), 0x0102_0304);
    }

    #[test]
    fn test_truncated_read() {
        let data = [0x01, 0x02];
        let mut reader = SectionReader::new(&data, LE32);
        let err = reader.read_u32().unwrap_err();
        assert_eq!(err.kind(), DwarfErrorKind::Truncated);
        // The failed read does not advance.
        assert_eq!(reader.pos(), 0);
    }

    #[test]
    fn test_uleb128_boundaries() {
        let mut reader = SectionReader::new(&[0x7f], LE32);
        assert_eq!(reader.read_uleb128().unwrap(), 127);

        let mut reader = SectionReader::new(&[0x80, 0x01], LE32);
        assert_eq!(reader.read_uleb128().unwrap(), 128);

        // u64::MAX takes exactly ten bytes.
        let encoded = encode_uleb128(u64::MAX);
        let mut reader = SectionReader::new(&encoded, LE32);
        assert_eq!(reader.read_uleb128().unwrap(), u64::MAX);
    }

    #[test]
    fn test_uleb128_unterminated() {
        let mut reader = SectionReader::new(&[0x80, 0x80], LE32);
        assert_eq!(
            reader.read_uleb128().unwrap_err().kind(),
            DwarfErrorKind::Truncated
        );

        let bytes = [0x80u8; 11];
        let mut reader = SectionReader::new(&bytes, LE32);
        assert_eq!(
            reader.read_uleb128().unwrap_err().kind(),
            DwarfErrorKind::Overflow
        );
    }

    #[test]
    fn test_sleb128_negative() {
        let mut reader = SectionReader::new(&[0x7f], LE32);
        assert_eq!(reader.read_sleb128().unwrap(), -1);

        let encoded = encode_sleb128(-12345);
        let mut reader = SectionReader::new(&encoded, LE32);
        assert_eq!(reader.read_sleb128().unwrap(), -12345);
    }

    #[test]
    fn test_initial_length_escape() {
        let mut data = vec![0xff, 0xff, 0xff, 0xff];
        data.extend_from_slice(&0x1234u64.to_le_bytes());
        let mut reader = SectionReader::new(&data, LE32);
        assert_eq!(reader.read_initial_length().unwrap(), 0x1234);
        assert_eq!(reader.encoding().offset_size, 8);

        let mut reader = SectionReader::new(&[0xf0, 0xff, 0xff, 0xff], LE32);
        assert_eq!(
            reader.read_initial_length().unwrap_err().kind(),
            DwarfErrorKind::InvalidDwarf
        );
    }

    #[test]
    fn test_cstr() {
        let mut reader = SectionReader::new(b"name\0rest", LE32);
        assert_eq!(reader.read_cstr().unwrap(), b"name");
        assert_eq!(reader.pos(), 5);
    }

    proptest! {
        #[test]
        fn test_uleb128_roundtrip(value: u64) {
            let encoded = encode_uleb128(value);
            let mut reader = SectionReader::new(&encoded, LE32);
            prop_assert_eq!(reader.read_uleb128().unwrap(), value);
            prop_assert!(reader.is_empty());
        }

        #[test]
        fn test_sleb128_roundtrip(value: i64) {
            let encoded = encode_sleb128(value);
            let mut reader = SectionReader::new(&encoded, LE32);
            prop_assert_eq!(reader.read_sleb128().unwrap(), value);
            prop_assert!(reader.is_empty());
        }
    }
}
