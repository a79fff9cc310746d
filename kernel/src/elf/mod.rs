//! ELF executable loader
//!
//! Reads a 64-bit little-endian RV64 executable from a stream, validates
//! it, and materialises every PT_LOAD segment into the current user
//! address space. Each rejection has its own [`ElfError`] variant so a
//! bad image can be diagnosed without a debugger.

pub mod types;

use types::{
    Elf64Header, Elf64ProgramHeader, EHDR_SIZE, ELFCLASS64, ELFDATA2LSB, ELF_MAGIC, EM_RISCV,
    ET_EXEC, PHDR_SIZE, PT_LOAD,
};

use crate::error::ElfError;
#[cfg(target_arch = "riscv64")]
use crate::io::{self, IoStream};
use crate::mm::{PAGE_SIZE, USER_END_VMA, USER_STACK_VMA, USER_START_VMA};

/// Validate the identification and machine fields of a header.
pub fn validate_header(header: &Elf64Header) -> Result<(), ElfError> {
    if header.magic != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    if header.class != ELFCLASS64 {
        return Err(ElfError::BadClass);
    }
    if header.data != ELFDATA2LSB {
        return Err(ElfError::BadEndian);
    }
    if header.elf_type != ET_EXEC || header.machine != EM_RISCV {
        return Err(ElfError::BadTypeOrMachine);
    }
    Ok(())
}

/// Check a PT_LOAD segment against the user region and the stack page.
pub fn validate_segment(phdr: &Elf64ProgramHeader) -> Result<(), ElfError> {
    let start = phdr.p_vaddr as usize;
    let end = phdr
        .p_vaddr
        .checked_add(phdr.p_memsz)
        .ok_or(ElfError::SegmentBounds)? as usize;
    if start < USER_START_VMA || end > USER_END_VMA || start > end {
        return Err(ElfError::SegmentBounds);
    }
    if phdr.p_filesz > phdr.p_memsz {
        return Err(ElfError::SegmentBounds);
    }
    // The stack page sits at the top of the user region and is never
    // loadable.
    let stack_base = USER_STACK_VMA - PAGE_SIZE;
    if start < USER_STACK_VMA && end > stack_base {
        return Err(ElfError::StackOverlap);
    }
    Ok(())
}

/// Load an executable into the current user address space.
///
/// Returns the image entry point. Pages covering each PT_LOAD segment
/// are mapped RWXU; frames come pre-zeroed, which provides the
/// `p_memsz - p_filesz` zero tail.
#[cfg(target_arch = "riscv64")]
pub fn load(image: &dyn IoStream) -> Result<usize, ElfError> {
    use crate::mm::page_table::PteFlags;
    use crate::mm::vmm;

    let mut ehdr_bytes = [0u8; EHDR_SIZE];
    io::seek(image, 0).map_err(|_| ElfError::Seek)?;
    io::read_exact(image, &mut ehdr_bytes).map_err(|_| ElfError::HeaderRead)?;
    let header = Elf64Header::parse(&ehdr_bytes);
    validate_header(&header)?;

    for i in 0..header.phnum {
        let offset = header.phoff + i as u64 * header.phentsize as u64;
        io::seek(image, offset).map_err(|_| ElfError::Seek)?;

        let mut phdr_bytes = [0u8; PHDR_SIZE];
        io::read_exact(image, &mut phdr_bytes).map_err(|_| ElfError::HeaderRead)?;
        let phdr = Elf64ProgramHeader::parse(&phdr_bytes);

        if phdr.p_type != PT_LOAD {
            continue;
        }
        validate_segment(&phdr)?;
        if phdr.p_memsz == 0 {
            continue;
        }

        let flags = PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U;
        vmm::alloc_and_map_range(phdr.p_vaddr as usize, phdr.p_memsz as usize, flags)
            .map_err(|_| ElfError::MapFailure)?;

        if phdr.p_filesz > 0 {
            io::seek(image, phdr.p_offset).map_err(|_| ElfError::Seek)?;
            // SAFETY: The covered pages were just mapped writable for
            // user and, with SUM set, for the kernel; the segment was
            // bounds-checked against the user region.
            let dst = unsafe {
                core::slice::from_raw_parts_mut(phdr.p_vaddr as *mut u8, phdr.p_filesz as usize)
            };
            io::read_exact(image, dst).map_err(|_| ElfError::SegmentRead)?;
        }
    }

    Ok(header.entry as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelResult;

    fn exec_header() -> Elf64Header {
        Elf64Header {
            magic: ELF_MAGIC,
            class: ELFCLASS64,
            data: ELFDATA2LSB,
            elf_type: ET_EXEC,
            machine: EM_RISCV,
            entry: USER_START_VMA as u64,
            phoff: 64,
            phentsize: PHDR_SIZE as u16,
            phnum: 1,
        }
    }

    #[test_case]
    fn accepts_a_valid_header() -> KernelResult<()> {
        assert_eq!(validate_header(&exec_header()), Ok(()));
        Ok(())
    }

    #[test_case]
    fn rejects_each_identification_field() -> KernelResult<()> {
        let mut h = exec_header();
        h.magic = [0, 0, 0, 0];
        assert_eq!(validate_header(&h), Err(ElfError::BadMagic));

        let mut h = exec_header();
        h.class = 1;
        assert_eq!(validate_header(&h), Err(ElfError::BadClass));

        let mut h = exec_header();
        h.data = 2;
        assert_eq!(validate_header(&h), Err(ElfError::BadEndian));

        let mut h = exec_header();
        h.machine = 62;
        assert_eq!(validate_header(&h), Err(ElfError::BadTypeOrMachine));

        let mut h = exec_header();
        h.elf_type = 3;
        assert_eq!(validate_header(&h), Err(ElfError::BadTypeOrMachine));
        Ok(())
    }

    fn load_segment(vaddr: u64, memsz: u64) -> Elf64ProgramHeader {
        Elf64ProgramHeader {
            p_type: PT_LOAD,
            p_flags: 0,
            p_offset: 0,
            p_vaddr: vaddr,
            p_filesz: memsz,
            p_memsz: memsz,
        }
    }

    #[test_case]
    fn segment_bounds_checks() -> KernelResult<()> {
        assert_eq!(
            validate_segment(&load_segment(USER_START_VMA as u64, 0x1000)),
            Ok(())
        );
        // Below the user region.
        assert_eq!(
            validate_segment(&load_segment(0x8000_0000, 0x1000)),
            Err(ElfError::SegmentBounds)
        );
        // Runs past the end of the user region.
        assert_eq!(
            validate_segment(&load_segment((USER_END_VMA - 0x800) as u64, 0x1000)),
            Err(ElfError::SegmentBounds)
        );
        // Reaches into the stack page.
        assert_eq!(
            validate_segment(&load_segment(
                (USER_STACK_VMA - PAGE_SIZE) as u64,
                PAGE_SIZE as u64
            )),
            Err(ElfError::StackOverlap)
        );
        Ok(())
    }

    #[test_case]
    fn header_round_trips_through_bytes() -> KernelResult<()> {
        let mut bytes = [0u8; EHDR_SIZE];
        bytes[0..4].copy_from_slice(&ELF_MAGIC);
        bytes[4] = ELFCLASS64;
        bytes[5] = ELFDATA2LSB;
        bytes[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        bytes[18..20].copy_from_slice(&EM_RISCV.to_le_bytes());
        bytes[24..32].copy_from_slice(&(0x8010_0000u64).to_le_bytes());
        bytes[32..40].copy_from_slice(&64u64.to_le_bytes());
        bytes[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        bytes[56..58].copy_from_slice(&2u16.to_le_bytes());

        let header = Elf64Header::parse(&bytes);
        assert_eq!(validate_header(&header), Ok(()));
        assert_eq!(header.entry, 0x8010_0000);
        assert_eq!(header.phnum, 2);
        Ok(())
    }
}
