//! CPU architectures and the per-architecture backend table.
//!
//! Everything target-specific that the generic DWARF, CFI and unwinding
//! layers need is collected in a [`Backend`] record: DWARF register naming,
//! the return-address column, the relocation types that write plain 4- or
//! 8-byte slots, the ABI-assumed initial CFI program, and the layout of the
//! register block inside an `NT_PRSTATUS` core note.

use std::fmt;
use std::str;

/// This file follows the first MIPS 32 bit ABI.
#[allow(unused)]
const EF_MIPS_ABI_O32: u32 = 0x0000_1000;
/// O32 ABI extended for 64-bit architecture.
const EF_MIPS_ABI_O64: u32 = 0x0000_2000;
/// EABI in 64 bit mode.
const EF_MIPS_ABI_EABI64: u32 = 0x0000_4000;

/// Any flag value that might indicate 64-bit MIPS.
const MIPS_64_FLAGS: u32 = EF_MIPS_ABI_O64 | EF_MIPS_ABI_EABI64;

const EM_386: u16 = 3;
const EM_MIPS: u16 = 8;
const EM_MIPS_RS3_LE: u16 = 10;
const EM_PPC: u16 = 20;
const EM_PPC64: u16 = 21;
const EM_S390: u16 = 22;
const EM_ARM: u16 = 40;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

/// Names for x86 CPU registers in DWARF numbering.
static I386: &[&str] = &[
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "eip", "eflags",
];

/// Names for x86_64 CPU registers in DWARF numbering.
static X86_64: &[&str] = &[
    "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "rip",
];

/// Names for 64-bit ARM CPU registers in DWARF numbering.
static AARCH64: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "sp",
];

/// Names for s390x CPU registers in DWARF numbering.
static S390X: &[&str] = &[
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "r13", "r14",
    "r15",
];

/// Names for 64-bit PowerPC general registers in DWARF numbering.
static PPC64: &[&str] = &[
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "r13", "r14",
    "r15", "r16", "r17", "r18", "r19", "r20", "r21", "r22", "r23", "r24", "r25", "r26", "r27",
    "r28", "r29", "r30", "r31",
];

/// Names for MIPS CPU registers in DWARF numbering.
static MIPS: &[&str] = &[
    "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5", "t6",
    "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1", "gp", "sp", "fp",
    "ra",
];

/// An error returned for an invalid [`Arch`].
#[derive(Debug)]
pub struct UnknownArchError;

impl fmt::Display for UnknownArchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown architecture")
    }
}

impl std::error::Error for UnknownArchError {}

/// An enumeration of the CPU architectures this toolkit understands.
///
/// Architectures are identified from the `e_machine` field of an ELF header
/// (plus `e_flags` where one machine value covers several ABIs, as on MIPS).
/// There is an `Unknown` variant so partially supported files still resolve
/// modules and symbols even when no [`Backend`] exists for them.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Arch {
    /// An architecture without a backend entry.
    #[default]
    Unknown,
    /// 32-bit x86.
    X86,
    /// 64-bit x86, also known as `x86_64`.
    Amd64,
    /// 32-bit ARM.
    Arm,
    /// 64-bit ARM (AArch64).
    Arm64,
    /// 32-bit big-endian PowerPC.
    Ppc,
    /// 64-bit PowerPC.
    Ppc64,
    /// 64-bit IBM z/Architecture.
    S390x,
    /// 32-bit MIPS.
    Mips,
    /// 64-bit MIPS.
    Mips64,
}

impl Arch {
    /// Determines the architecture from ELF header fields.
    pub fn from_elf(e_machine: u16, e_flags: u32) -> Self {
        match e_machine {
            EM_386 => Arch::X86,
            EM_X86_64 => Arch::Amd64,
            EM_ARM => Arch::Arm,
            EM_AARCH64 => Arch::Arm64,
            EM_PPC => Arch::Ppc,
            EM_PPC64 => Arch::Ppc64,
            EM_S390 => Arch::S390x,
            EM_MIPS | EM_MIPS_RS3_LE => {
                if e_flags & MIPS_64_FLAGS != 0 {
                    Arch::Mips64
                } else {
                    Arch::Mips
                }
            }
            _ => Arch::Unknown,
        }
    }

    /// The canonical lowercase name of this architecture.
    pub fn name(self) -> &'static str {
        match self {
            Arch::Unknown => "unknown",
            Arch::X86 => "x86",
            Arch::Amd64 => "x86_64",
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
            Arch::Ppc => "ppc",
            Arch::Ppc64 => "ppc64",
            Arch::S390x => "s390x",
            Arch::Mips => "mips",
            Arch::Mips64 => "mips64",
        }
    }

    /// The native pointer size in bytes, if known.
    pub fn pointer_size(self) -> Option<usize> {
        match self {
            Arch::Unknown => None,
            Arch::Amd64 | Arch::Arm64 | Arch::Ppc64 | Arch::S390x | Arch::Mips64 => Some(8),
            Arch::X86 | Arch::Arm | Arch::Ppc | Arch::Mips => Some(4),
        }
    }

    /// Resolves the DWARF name of a register number for this architecture.
    ///
    /// Returns `None` if the architecture is unknown or the register number
    /// has no name in its table. PowerPC's `lr`/`ctr` live outside the
    /// general-register block and are special-cased.
    pub fn register_name(self, register: u16) -> Option<&'static str> {
        let index = register as usize;

        let opt = match self {
            Arch::X86 => I386.get(index),
            Arch::Amd64 => X86_64.get(index),
            Arch::Arm64 => AARCH64.get(index),
            Arch::S390x => S390X.get(index),
            Arch::Ppc | Arch::Ppc64 => match register {
                65 => Some(&"lr"),
                66 => Some(&"ctr"),
                _ => PPC64.get(index),
            },
            Arch::Mips | Arch::Mips64 => MIPS.get(index),
            _ => None,
        };

        opt.copied().filter(|name| !name.is_empty())
    }
}

impl str::FromStr for Arch {
    type Err = UnknownArchError;

    fn from_str(s: &str) -> Result<Self, UnknownArchError> {
        Ok(match s {
            "x86" | "i386" | "i686" => Arch::X86,
            "x86_64" | "amd64" => Arch::Amd64,
            "arm" => Arch::Arm,
            "arm64" | "aarch64" => Arch::Arm64,
            "ppc" => Arch::Ppc,
            "ppc64" | "ppc64le" => Arch::Ppc64,
            "s390x" => Arch::S390x,
            "mips" => Arch::Mips,
            "mips64" => Arch::Mips64,
            _ => return Err(UnknownArchError),
        })
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The ABI-assumed CFI program of an architecture.
///
/// These instructions establish the unwind rules that FDEs on the platform
/// rely on without spelling them out, such as "the return address lives in
/// `r14`" on s390. The table builder interprets them before a CIE's own
/// initial instructions, with the alignment factors given here.
#[derive(Clone, Copy, Debug)]
pub struct AbiCfi {
    /// A raw `DW_CFA_*` instruction stream.
    pub instructions: &'static [u8],
    /// Code alignment factor for interpreting `instructions`.
    pub code_alignment_factor: u64,
    /// Data alignment factor for interpreting `instructions`.
    pub data_alignment_factor: i64,
}

/// Layout of the general-register block inside an `NT_PRSTATUS` note.
///
/// `regs` maps DWARF register numbers to byte offsets within the `pr_reg`
/// area; the program counter additionally gets its own slot because not
/// every architecture assigns it a DWARF number.
#[derive(Clone, Copy, Debug)]
pub struct CoreRegLayout {
    /// Offset of the `pr_reg` block within the note descriptor.
    pub pr_reg_offset: usize,
    /// Size in bytes of one register slot.
    pub reg_size: usize,
    /// `(dwarf register, offset within pr_reg)` pairs.
    pub regs: &'static [(u16, usize)],
    /// Offset of the program counter within `pr_reg`.
    pub pc_offset: usize,
}

/// The per-architecture table consulted by the generic layers.
#[derive(Clone, Copy, Debug)]
pub struct Backend {
    /// The architecture this entry describes.
    pub arch: Arch,
    /// Number of DWARF register columns tracked while unwinding.
    pub nregs: u16,
    /// The DWARF register holding the return address, per the platform ABI.
    pub return_address_register: u16,
    /// ABI-assumed initial CFI, prepended to every CIE's instructions.
    pub abi_cfi: AbiCfi,
    /// Relocation types that patch an 8-byte slot in debug sections.
    pub reloc8_types: &'static [u32],
    /// Relocation types that patch a 4-byte slot in debug sections.
    pub reloc4_types: &'static [u32],
    /// Register layout of `NT_PRSTATUS` core notes, where supported.
    pub core_regs: Option<CoreRegLayout>,
    /// Whether function symbols are descriptors that must be dereferenced
    /// through `.opd` to find the code entry point (64-bit PowerPC ELFv1).
    pub function_descriptors: bool,
}

const R_X86_64_64: u32 = 1;
const R_X86_64_32: u32 = 10;
const R_X86_64_32S: u32 = 11;
const R_386_32: u32 = 1;
const R_AARCH64_ABS64: u32 = 257;
const R_AARCH64_ABS32: u32 = 258;
const R_PPC64_ADDR32: u32 = 1;
const R_PPC64_ADDR64: u32 = 38;
const R_390_32: u32 = 4;
const R_390_64: u32 = 22;
const R_MIPS_32: u32 = 2;
const R_MIPS_64: u32 = 18;

// DW_CFA opcodes used in the ABI programs below.
const CFA_SAME_VALUE: u8 = 0x08;
const CFA_DEF_CFA: u8 = 0x0c;
const CFA_OFFSET: u8 = 0x80;

/// Offset of `pr_reg` in a 64-bit `elf_prstatus`.
const PRSTATUS_REGS_64: usize = 112;
/// Offset of `pr_reg` in a 32-bit `elf_prstatus`.
const PRSTATUS_REGS_32: usize = 72;

static AMD64_ABI_CFI: &[u8] = &[
    // CFA is rsp+8 on function entry, return address at CFA-8.
    CFA_DEF_CFA, 7, 8,
    CFA_OFFSET | 16, 1,
    // Callee-saved registers are inherited when an FDE does not mention them.
    CFA_SAME_VALUE, 3,
    CFA_SAME_VALUE, 6,
    CFA_SAME_VALUE, 12,
    CFA_SAME_VALUE, 13,
    CFA_SAME_VALUE, 14,
    CFA_SAME_VALUE, 15,
];

static X86_ABI_CFI: &[u8] = &[
    CFA_DEF_CFA, 4, 4,
    CFA_OFFSET | 8, 1,
    CFA_SAME_VALUE, 3,
    CFA_SAME_VALUE, 5,
    CFA_SAME_VALUE, 6,
    CFA_SAME_VALUE, 7,
];

static AARCH64_ABI_CFI: &[u8] = &[
    CFA_DEF_CFA, 31, 0,
    CFA_SAME_VALUE, 19,
    CFA_SAME_VALUE, 20,
    CFA_SAME_VALUE, 21,
    CFA_SAME_VALUE, 22,
    CFA_SAME_VALUE, 23,
    CFA_SAME_VALUE, 24,
    CFA_SAME_VALUE, 25,
    CFA_SAME_VALUE, 26,
    CFA_SAME_VALUE, 27,
    CFA_SAME_VALUE, 28,
    CFA_SAME_VALUE, 29,
    CFA_SAME_VALUE, 30,
];

static S390X_ABI_CFI: &[u8] = &[
    // The only instruction provided in every s390 CIE.
    CFA_DEF_CFA, 15, 96,
    // FDEs assume all gprs inherited, r14 carries the return address.
    CFA_SAME_VALUE, 0,
    CFA_SAME_VALUE, 1,
    CFA_SAME_VALUE, 2,
    CFA_SAME_VALUE, 3,
    CFA_SAME_VALUE, 4,
    CFA_SAME_VALUE, 5,
    CFA_SAME_VALUE, 6,
    CFA_SAME_VALUE, 7,
    CFA_SAME_VALUE, 8,
    CFA_SAME_VALUE, 9,
    CFA_SAME_VALUE, 10,
    CFA_SAME_VALUE, 11,
    CFA_SAME_VALUE, 12,
    CFA_SAME_VALUE, 13,
    CFA_SAME_VALUE, 14,
    CFA_SAME_VALUE, 15,
];

static PPC64_ABI_CFI: &[u8] = &[
    CFA_DEF_CFA, 1, 0,
    CFA_SAME_VALUE, 65,
];

static MIPS64_ABI_CFI: &[u8] = &[
    CFA_DEF_CFA, 29, 0,
    CFA_SAME_VALUE, 31,
];

static AMD64_CORE_REGS: &[(u16, usize)] = &[
    (0, 80),   // rax
    (1, 96),   // rdx
    (2, 88),   // rcx
    (3, 40),   // rbx
    (4, 104),  // rsi
    (5, 112),  // rdi
    (6, 32),   // rbp
    (7, 152),  // rsp
    (8, 72),
    (9, 64),
    (10, 56),
    (11, 48),
    (12, 24),
    (13, 16),
    (14, 8),
    (15, 0),
    (16, 128), // rip
];

static X86_CORE_REGS: &[(u16, usize)] = &[
    (0, 24), // eax
    (1, 4),  // ecx
    (2, 8),  // edx
    (3, 0),  // ebx
    (4, 60), // esp
    (5, 20), // ebp
    (6, 12), // esi
    (7, 16), // edi
    (8, 48), // eip
];

static AARCH64_CORE_REGS: &[(u16, usize)] = &[
    (0, 0),
    (1, 8),
    (2, 16),
    (3, 24),
    (4, 32),
    (5, 40),
    (6, 48),
    (7, 56),
    (8, 64),
    (9, 72),
    (10, 80),
    (11, 88),
    (12, 96),
    (13, 104),
    (14, 112),
    (15, 120),
    (16, 128),
    (17, 136),
    (18, 144),
    (19, 152),
    (20, 160),
    (21, 168),
    (22, 176),
    (23, 184),
    (24, 192),
    (25, 200),
    (26, 208),
    (27, 216),
    (28, 224),
    (29, 232),
    (30, 240),
    (31, 248), // sp
];

static BACKENDS: &[Backend] = &[
    Backend {
        arch: Arch::Amd64,
        nregs: 17,
        return_address_register: 16,
        abi_cfi: AbiCfi {
            instructions: AMD64_ABI_CFI,
            code_alignment_factor: 1,
            data_alignment_factor: -8,
        },
        reloc8_types: &[R_X86_64_64],
        reloc4_types: &[R_X86_64_32, R_X86_64_32S],
        core_regs: Some(CoreRegLayout {
            pr_reg_offset: PRSTATUS_REGS_64,
            reg_size: 8,
            regs: AMD64_CORE_REGS,
            pc_offset: 128,
        }),
        function_descriptors: false,
    },
    Backend {
        arch: Arch::X86,
        nregs: 9,
        return_address_register: 8,
        abi_cfi: AbiCfi {
            instructions: X86_ABI_CFI,
            code_alignment_factor: 1,
            data_alignment_factor: -4,
        },
        reloc8_types: &[],
        reloc4_types: &[R_386_32],
        core_regs: Some(CoreRegLayout {
            pr_reg_offset: PRSTATUS_REGS_32,
            reg_size: 4,
            regs: X86_CORE_REGS,
            pc_offset: 48,
        }),
        function_descriptors: false,
    },
    Backend {
        arch: Arch::Arm64,
        nregs: 32,
        return_address_register: 30,
        abi_cfi: AbiCfi {
            instructions: AARCH64_ABI_CFI,
            code_alignment_factor: 1,
            data_alignment_factor: -8,
        },
        reloc8_types: &[R_AARCH64_ABS64],
        reloc4_types: &[R_AARCH64_ABS32],
        core_regs: Some(CoreRegLayout {
            pr_reg_offset: PRSTATUS_REGS_64,
            reg_size: 8,
            regs: AARCH64_CORE_REGS,
            pc_offset: 256,
        }),
        function_descriptors: false,
    },
    Backend {
        arch: Arch::S390x,
        nregs: 16,
        return_address_register: 14,
        abi_cfi: AbiCfi {
            instructions: S390X_ABI_CFI,
            code_alignment_factor: 1,
            data_alignment_factor: 8,
        },
        reloc8_types: &[R_390_64],
        reloc4_types: &[R_390_32],
        core_regs: None,
        function_descriptors: false,
    },
    Backend {
        arch: Arch::Ppc64,
        nregs: 66,
        return_address_register: 65,
        abi_cfi: AbiCfi {
            instructions: PPC64_ABI_CFI,
            code_alignment_factor: 1,
            data_alignment_factor: 8,
        },
        reloc8_types: &[R_PPC64_ADDR64],
        reloc4_types: &[R_PPC64_ADDR32],
        core_regs: None,
        function_descriptors: true,
    },
    Backend {
        arch: Arch::Mips64,
        nregs: 32,
        return_address_register: 31,
        abi_cfi: AbiCfi {
            instructions: MIPS64_ABI_CFI,
            code_alignment_factor: 1,
            data_alignment_factor: -8,
        },
        reloc8_types: &[R_MIPS_64],
        reloc4_types: &[R_MIPS_32],
        core_regs: None,
        function_descriptors: false,
    },
];

impl Backend {
    /// Looks up the backend entry for an architecture.
    ///
    /// Returns `None` for architectures without a table entry; callers fall
    /// back to container-level information only (no relocation digestion,
    /// no unwinding).
    pub fn for_arch(arch: Arch) -> Option<&'static Backend> {
        BACKENDS.iter().find(|backend| backend.arch == arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn test_from_elf() {
        assert_eq!(Arch::from_elf(EM_X86_64, 0), Arch::Amd64);
        assert_eq!(Arch::from_elf(EM_MIPS, EF_MIPS_ABI_O64), Arch::Mips64);
        assert_eq!(Arch::from_elf(EM_MIPS, 0), Arch::Mips);
        assert_eq!(Arch::from_elf(0xffff, 0), Arch::Unknown);
    }

    #[test]
    fn test_register_names() {
        assert_eq!(Arch::Amd64.register_name(16), Some("rip"));
        assert_eq!(Arch::Amd64.register_name(17), None);
        assert_eq!(Arch::Ppc64.register_name(65), Some("lr"));
        assert_eq!(Arch::Unknown.register_name(0), None);
    }

    #[test]
    fn test_backend_table() {
        let backend = Backend::for_arch(Arch::Amd64).unwrap();
        assert_eq!(backend.return_address_register, 16);
        assert!(backend.core_regs.is_some());

        assert!(Backend::for_arch(Arch::Unknown).is_none());
    }

    #[test]
    fn test_core_layout_covers_pc() {
        for backend in BACKENDS {
            if let Some(layout) = backend.core_regs {
                assert!(layout.regs.iter().all(|&(reg, _)| reg < backend.nregs));
            }
        }
    }
}
