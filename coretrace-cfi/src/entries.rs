//! Raw CIE and FDE records from a CFI section.

use fallible_iterator::FallibleIterator;

use coretrace_dwarf::constants::*;
use coretrace_dwarf::{Encoding, Endian, SectionReader};

use crate::error::{CfiError, CfiErrorKind};

/// A CFI-bearing section and the parameters needed to decode it.
#[derive(Clone, Copy, Debug)]
pub struct CfiSection<'d> {
    data: &'d [u8],
    endian: Endian,
    address_size: u8,
    eh_frame: bool,
    /// The virtual address the section is mapped at, the base for
    /// pc-relative pointer encodings.
    section_address: u64,
}

/// One decoded Common Information Entry.
#[derive(Clone, Debug)]
pub struct Cie<'d> {
    /// Section offset of this CIE.
    pub offset: u64,
    /// The CIE version (1 for DWARF 2 and `.eh_frame`, 3 and 4 for later
    /// DWARF).
    pub version: u8,
    /// The augmentation string, without its terminator.
    pub augmentation: &'d [u8],
    /// Factor applied to `advance_loc` deltas.
    pub code_alignment_factor: u64,
    /// Factor applied to register offsets.
    pub data_alignment_factor: i64,
    /// The column holding the caller's return address.
    pub return_address_register: u16,
    /// Address size for pointers in this CIE's FDEs.
    pub address_size: u8,
    /// Whether FDEs of this CIE carry a length-prefixed augmentation
    /// blob (`'z'`).
    pub fde_has_augmentation: bool,
    /// The `DW_EH_PE_*` encoding of FDE address pointers.
    pub fde_pointer_encoding: u8,
    /// The encoding of the LSDA pointer in FDE augmentation data.
    pub lsda_encoding: Option<u8>,
    /// The personality routine address, when the CIE names one.
    pub personality: Option<u64>,
    /// Whether frames of this CIE are signal delivery frames.
    pub signal_frame: bool,
    /// The instruction stream establishing the initial unwind state.
    pub initial_instructions: &'d [u8],
    /// Section offset of `initial_instructions`.
    pub initial_instructions_offset: u64,
}

/// An FDE whose pointers have not been decoded yet.
///
/// Decoding the initial location needs the referenced CIE's pointer
/// encoding; use [`CfiSection::decode_fde`].
#[derive(Clone, Copy, Debug)]
pub struct RawFde<'d> {
    /// Section offset of this FDE.
    pub offset: u64,
    /// Section offset of the CIE this FDE refers to.
    pub cie_offset: u64,
    body: &'d [u8],
    body_offset: u64,
}

/// One decoded Frame Description Entry.
#[derive(Clone, Copy, Debug)]
pub struct Fde<'d> {
    /// Section offset of this FDE.
    pub offset: u64,
    /// Section offset of the CIE this FDE refers to.
    pub cie_offset: u64,
    /// First PC covered.
    pub initial_location: u64,
    /// Number of bytes of program covered.
    pub address_range: u64,
    /// The FDE's own instruction stream.
    pub instructions: &'d [u8],
    /// Section offset of `instructions`.
    pub instructions_offset: u64,
}

/// One record of a CFI section.
#[derive(Clone, Debug)]
pub enum CfiEntry<'d> {
    /// A Common Information Entry.
    Cie(Cie<'d>),
    /// A Frame Description Entry, pointers still encoded.
    Fde(RawFde<'d>),
}

impl<'d> CfiSection<'d> {
    /// Creates a view over a `.debug_frame` section.
    pub fn debug_frame(data: &'d [u8], endian: Endian, address_size: u8) -> Self {
        CfiSection {
            data,
            endian,
            address_size,
            eh_frame: false,
            section_address: 0,
        }
    }

    /// Creates a view over an `.eh_frame` section mapped at
    /// `section_address`.
    pub fn eh_frame(
        data: &'d [u8],
        endian: Endian,
        address_size: u8,
        section_address: u64,
    ) -> Self {
        CfiSection {
            data,
            endian,
            address_size,
            eh_frame: true,
            section_address,
        }
    }

    /// Whether this is an `.eh_frame` section.
    pub fn is_eh_frame(&self) -> bool {
        self.eh_frame
    }

    /// The byte order of the section.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// The address size used for pointers in the section.
    pub fn address_size(&self) -> u8 {
        self.address_size
    }

    fn encoding(&self) -> Encoding {
        Encoding::new(self.endian, self.address_size)
    }

    /// Iterates all records in section order.
    pub fn entries(&self) -> CfiEntriesIter<'d> {
        CfiEntriesIter {
            section: *self,
            offset: 0,
            done: false,
        }
    }

    /// Parses the single record at `offset`.
    pub fn entry_at(&self, offset: u64) -> Result<Option<(CfiEntry<'d>, u64)>, CfiError> {
        let mut reader = SectionReader::at(self.data, self.encoding(), offset as usize)
            .map_err(|_| CfiErrorKind::Truncated)?;
        if reader.is_empty() {
            return Ok(None);
        }

        let length = reader.read_initial_length().map_err(CfiError::from)?;
        if length == 0 {
            // The .eh_frame zero terminator.
            return Ok(None);
        }
        let offset_size = reader.encoding().offset_size;

        let content_end = reader.pos() as u64 + length;
        if content_end > self.data.len() as u64 {
            return Err(CfiErrorKind::Truncated.into());
        }

        let id_pos = reader.pos() as u64;
        let id = reader.read_offset()?;

        let cie_id = if self.eh_frame {
            0
        } else if offset_size == 8 {
            u64::MAX
        } else {
            u64::from(u32::MAX)
        };

        let entry = if id == cie_id {
            CfiEntry::Cie(self.parse_cie(offset, &mut reader, content_end)?)
        } else {
            // .debug_frame stores the CIE's section offset; .eh_frame
            // stores the distance back from the id field to the CIE.
            let cie_offset = if self.eh_frame {
                id_pos
                    .checked_sub(id)
                    .ok_or(CfiErrorKind::InvalidCfi)?
            } else {
                id
            };
            let body_offset = reader.pos() as u64;
            let body = &self.data[body_offset as usize..content_end as usize];
            CfiEntry::Fde(RawFde {
                offset,
                cie_offset,
                body,
                body_offset,
            })
        };

        Ok(Some((entry, content_end)))
    }

    fn parse_cie(
        &self,
        offset: u64,
        reader: &mut SectionReader<'d>,
        content_end: u64,
    ) -> Result<Cie<'d>, CfiError> {
        let version = reader.read_u8()?;
        if version != 1 && version != 3 && version != 4 {
            return Err(CfiErrorKind::UnsupportedVersion(version).into());
        }

        let augmentation = reader.read_cstr()?;

        // The ancient GCC "eh" augmentation carries one extra word right
        // after the string.
        let mut augmentation = augmentation;
        if augmentation.starts_with(b"eh") {
            reader.skip(self.address_size as usize)?;
            augmentation = &augmentation[2..];
        }

        let mut address_size = self.address_size;
        if version == 4 {
            address_size = reader.read_u8()?;
            let segment_size = reader.read_u8()?;
            if segment_size != 0 || (address_size != 4 && address_size != 8) {
                return Err(CfiErrorKind::InvalidCfi.into());
            }
        }

        let code_alignment_factor = reader.read_uleb128()?;
        let data_alignment_factor = reader.read_sleb128()?;
        let return_address_register = if version == 1 {
            u16::from(reader.read_u8()?)
        } else {
            let reg = reader.read_uleb128()?;
            u16::try_from(reg).map_err(|_| CfiErrorKind::InvalidCfi)?
        };

        let mut fde_has_augmentation = false;
        let mut fde_pointer_encoding = DW_EH_PE_absptr;
        let mut lsda_encoding = None;
        let mut personality = None;
        let mut signal_frame = false;

        if augmentation.first() == Some(&b'z') {
            fde_has_augmentation = true;
            let len = reader.read_uleb128()? as usize;
            let aug_offset = reader.pos() as u64;
            let mut aug = reader.split(len)?;

            for &ch in &augmentation[1..] {
                match ch {
                    b'L' => lsda_encoding = Some(aug.read_u8()?),
                    b'P' => {
                        let encoding = aug.read_u8()?;
                        let value_offset = aug_offset + aug.pos() as u64;
                        personality =
                            Some(self.read_encoded(&mut aug, encoding, value_offset)?);
                    }
                    b'R' => fde_pointer_encoding = aug.read_u8()?,
                    b'S' => signal_frame = true,
                    _ => return Err(CfiErrorKind::UnknownAugmentation.into()),
                }
            }
        } else if !augmentation.is_empty() {
            // Without 'z' there is no way to skip unknown augmentation
            // data reliably.
            return Err(CfiErrorKind::UnknownAugmentation.into());
        }

        let initial_instructions_offset = reader.pos() as u64;
        let initial_instructions =
            &self.data[initial_instructions_offset as usize..content_end as usize];

        Ok(Cie {
            offset,
            version,
            augmentation,
            code_alignment_factor,
            data_alignment_factor,
            return_address_register,
            address_size,
            fde_has_augmentation,
            fde_pointer_encoding,
            lsda_encoding,
            personality,
            signal_frame,
            initial_instructions,
            initial_instructions_offset,
        })
    }

    /// Decodes an FDE's pointers using its CIE.
    pub fn decode_fde(&self, cie: &Cie<'d>, raw: &RawFde<'d>) -> Result<Fde<'d>, CfiError> {
        let mut reader = SectionReader::new(raw.body, self.encoding());

        let encoding = if self.eh_frame {
            cie.fde_pointer_encoding
        } else {
            DW_EH_PE_absptr
        };

        let location_offset = raw.body_offset + reader.pos() as u64;
        let initial_location = self.read_encoded(&mut reader, encoding, location_offset)?;
        // The range is always an absolute count, whatever the location
        // encoding's application was.
        let address_range = self.read_encoded_value(&mut reader, encoding)?;

        if cie.fde_has_augmentation {
            let len = reader.read_uleb128()? as usize;
            reader.skip(len)?;
        }

        let instructions_offset = raw.body_offset + reader.pos() as u64;
        let instructions = &raw.body[reader.pos()..];

        Ok(Fde {
            offset: raw.offset,
            cie_offset: raw.cie_offset,
            initial_location,
            address_range,
            instructions,
            instructions_offset,
        })
    }

    /// Reads a pointer in a `DW_EH_PE_*` encoding, applying its base.
    ///
    /// `value_offset` is the section offset of the value itself, needed
    /// for pc-relative application.
    pub(crate) fn read_encoded(
        &self,
        reader: &mut SectionReader<'d>,
        encoding: u8,
        value_offset: u64,
    ) -> Result<u64, CfiError> {
        if encoding == DW_EH_PE_omit {
            return Ok(0);
        }
        let value = self.read_encoded_value(reader, encoding)?;
        match encoding & 0x70 {
            DW_EH_PE_absptr => Ok(value),
            DW_EH_PE_pcrel => Ok(self
                .section_address
                .wrapping_add(value_offset)
                .wrapping_add(value)),
            other => Err(CfiErrorKind::UnsupportedEncoding(other).into()),
        }
    }

    fn read_encoded_value(
        &self,
        reader: &mut SectionReader<'d>,
        encoding: u8,
    ) -> Result<u64, CfiError> {
        if encoding == DW_EH_PE_omit {
            return Ok(0);
        }
        if encoding & DW_EH_PE_indirect != 0 {
            return Err(CfiErrorKind::UnsupportedEncoding(encoding).into());
        }
        let value = match encoding & 0x0f {
            DW_EH_PE_absptr => reader.read_word(self.address_size)?,
            DW_EH_PE_uleb128 => reader.read_uleb128()?,
            DW_EH_PE_udata2 => u64::from(reader.read_u16()?),
            DW_EH_PE_udata4 => u64::from(reader.read_u32()?),
            DW_EH_PE_udata8 => reader.read_u64()?,
            DW_EH_PE_sleb128 => reader.read_sleb128()? as u64,
            DW_EH_PE_sdata2 => reader.read_u16()? as i16 as i64 as u64,
            DW_EH_PE_sdata4 => reader.read_u32()? as i32 as i64 as u64,
            DW_EH_PE_sdata8 => reader.read_u64()?,
            other => return Err(CfiErrorKind::UnsupportedEncoding(other).into()),
        };
        Ok(value)
    }
}

/// Iterator over the records of a CFI section, in section order.
///
/// The equivalent of repeatedly calling the low-level "next CFI entry"
/// decoder: each step yields either a CIE or a raw FDE, independent of the
/// table builder layered on top.
pub struct CfiEntriesIter<'d> {
    section: CfiSection<'d>,
    offset: u64,
    done: bool,
}

impl<'d> FallibleIterator for CfiEntriesIter<'d> {
    type Item = CfiEntry<'d>;
    type Error = CfiError;

    fn next(&mut self) -> Result<Option<CfiEntry<'d>>, CfiError> {
        if self.done {
            return Ok(None);
        }
        match self.section.entry_at(self.offset)? {
            None => {
                self.done = true;
                Ok(None)
            }
            Some((entry, next_offset)) => {
                self.offset = next_offset;
                Ok(Some(entry))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    fn le64() -> (Endian, u8) {
        (Endian::Little, 8)
    }

    /// A minimal .debug_frame CIE: version 1, empty augmentation.
    fn debug_frame_cie() -> Vec<u8> {
        let mut data = Vec::new();
        let content = {
            let mut c = Vec::new();
            c.extend_from_slice(&u32::MAX.to_le_bytes()); // CIE id
            c.push(1); // version
            c.push(0); // augmentation ""
            c.push(1); // code alignment
            c.push(0x78); // data alignment -8
            c.push(16); // return address register
            c.extend_from_slice(&[DW_CFA_def_cfa, 7, 8]);
            c
        };
        data.extend_from_slice(&(content.len() as u32).to_le_bytes());
        data.extend_from_slice(&content);
        data
    }

    #[test]
    fn test_debug_frame_cie() {
        let data = debug_frame_cie();
        let (endian, address_size) = le64();
        let section = CfiSection::debug_frame(&data, endian, address_size);

        let entries: Vec<_> = section.entries().collect().unwrap();
        assert_eq!(entries.len(), 1);
        let CfiEntry::Cie(cie) = &entries[0] else {
            panic!("expected a CIE");
        };
        assert_eq!(cie.version, 1);
        assert_eq!(cie.code_alignment_factor, 1);
        assert_eq!(cie.data_alignment_factor, -8);
        assert_eq!(cie.return_address_register, 16);
        assert_eq!(cie.initial_instructions, &[DW_CFA_def_cfa, 7, 8]);
        assert!(!cie.signal_frame);
    }

    #[test]
    fn test_debug_frame_fde() {
        let mut data = debug_frame_cie();
        let fde_content = {
            let mut c = Vec::new();
            c.extend_from_slice(&0u32.to_le_bytes()); // CIE at offset 0
            c.extend_from_slice(&0x1000u64.to_le_bytes()); // initial location
            c.extend_from_slice(&0x40u64.to_le_bytes()); // address range
            c.push(DW_CFA_nop);
            c
        };
        data.extend_from_slice(&(fde_content.len() as u32).to_le_bytes());
        data.extend_from_slice(&fde_content);

        let (endian, address_size) = le64();
        let section = CfiSection::debug_frame(&data, endian, address_size);
        let entries: Vec<_> = section.entries().collect().unwrap();
        assert_eq!(entries.len(), 2);

        let CfiEntry::Cie(cie) = &entries[0] else {
            panic!("expected a CIE");
        };
        let CfiEntry::Fde(raw) = &entries[1] else {
            panic!("expected an FDE");
        };
        assert_eq!(raw.cie_offset, 0);

        let fde = section.decode_fde(cie, raw).unwrap();
        assert_eq!(fde.initial_location, 0x1000);
        assert_eq!(fde.address_range, 0x40);
        assert_eq!(fde.instructions, &[DW_CFA_nop]);
    }

    #[test]
    fn test_eh_frame_with_augmentation() {
        // CIE with "zR" augmentation selecting pcrel | sdata4 pointers.
        let mut data = Vec::new();
        let cie_content = {
            let mut c = Vec::new();
            c.extend_from_slice(&0u32.to_le_bytes()); // CIE id (eh_frame)
            c.push(1); // version
            c.extend_from_slice(b"zR\0");
            c.push(1); // code alignment
            c.push(0x78); // data alignment -8
            c.push(16); // return address register
            c.push(1); // augmentation length
            c.push(DW_EH_PE_pcrel | DW_EH_PE_sdata4);
            c.push(DW_CFA_nop);
            c
        };
        data.extend_from_slice(&(cie_content.len() as u32).to_le_bytes());
        data.extend_from_slice(&cie_content);

        let fde_offset = data.len() as u64;
        let fde_content = {
            let mut c = Vec::new();
            // Distance from the id field back to the CIE start.
            c.extend_from_slice(&((fde_offset + 4) as u32).to_le_bytes());
            // initial location, pc-relative to its own slot.
            c.extend_from_slice(&0x100i32.to_le_bytes());
            c.extend_from_slice(&0x40i32.to_le_bytes()); // range
            c.push(0); // FDE augmentation length
            c.push(DW_CFA_nop);
            c
        };
        data.extend_from_slice(&(fde_content.len() as u32).to_le_bytes());
        data.extend_from_slice(&fde_content);
        // Zero terminator.
        data.extend_from_slice(&0u32.to_le_bytes());

        let section = CfiSection::eh_frame(&data, Endian::Little, 8, 0x4000);
        let entries: Vec<_> = section.entries().collect().unwrap();
        assert_eq!(entries.len(), 2);

        let CfiEntry::Cie(cie) = &entries[0] else {
            panic!("expected a CIE");
        };
        assert_eq!(cie.fde_pointer_encoding, DW_EH_PE_pcrel | DW_EH_PE_sdata4);

        let CfiEntry::Fde(raw) = &entries[1] else {
            panic!("expected an FDE");
        };
        assert_eq!(raw.cie_offset, 0);

        let fde = section.decode_fde(cie, raw).unwrap();
        // 0x4000 (section) + fde_offset + 8 (slot) + 0x100.
        assert_eq!(fde.initial_location, 0x4000 + fde_offset + 8 + 0x100);
        assert_eq!(fde.address_range, 0x40);
    }

    #[test]
    fn test_eh_frame_zero_terminator() {
        let data = 0u32.to_le_bytes();
        let section = CfiSection::eh_frame(&data, Endian::Little, 8, 0);
        assert!(section.entries().next().unwrap().is_none());
    }
}
