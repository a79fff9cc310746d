//! ELF64 type definitions
//!
//! Header and program-header records with explicit little-endian
//! decoding, separated from the loader for maintainability.

/// ELF magic number
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// e_ident[4]: 64-bit class
pub const ELFCLASS64: u8 = 2;

/// e_ident[5]: little-endian data
pub const ELFDATA2LSB: u8 = 1;

/// e_type: executable file
pub const ET_EXEC: u16 = 2;

/// e_machine: RISC-V
pub const EM_RISCV: u16 = 243;

/// p_type: loadable segment
pub const PT_LOAD: u32 = 1;

/// Size of the on-disk ELF64 header.
pub const EHDR_SIZE: usize = 64;

/// Size of one on-disk program header.
pub const PHDR_SIZE: usize = 56;

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(bytes[offset..offset + 2].try_into().unwrap())
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

/// ELF header
#[derive(Debug, Clone, Copy)]
pub struct Elf64Header {
    pub magic: [u8; 4],
    pub class: u8,
    pub data: u8,
    pub elf_type: u16,
    pub machine: u16,
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

impl Elf64Header {
    /// Decode the fixed 64-byte header.
    pub fn parse(bytes: &[u8; EHDR_SIZE]) -> Self {
        Self {
            magic: bytes[0..4].try_into().unwrap(),
            class: bytes[4],
            data: bytes[5],
            elf_type: read_u16(bytes, 16),
            machine: read_u16(bytes, 18),
            entry: read_u64(bytes, 24),
            phoff: read_u64(bytes, 32),
            phentsize: read_u16(bytes, 54),
            phnum: read_u16(bytes, 56),
        }
    }
}

/// Program header
#[derive(Debug, Clone, Copy)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
}

impl Elf64ProgramHeader {
    /// Decode one 56-byte program header.
    pub fn parse(bytes: &[u8; PHDR_SIZE]) -> Self {
        Self {
            p_type: read_u32(bytes, 0),
            p_flags: read_u32(bytes, 4),
            p_offset: read_u64(bytes, 8),
            p_vaddr: read_u64(bytes, 16),
            p_filesz: read_u64(bytes, 32),
            p_memsz: read_u64(bytes, 40),
        }
    }
}
