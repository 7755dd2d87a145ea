//! ELF64 header/program-header parsing and validation — the reference
//! kernel's `load()`/`validate_segment()` in `userprog/process.c`, split from
//! the actual mapping step: this module only decides *whether* a binary is
//! loadable and *where* its segments go, lazily. `process::exec` is the one
//! that turns a validated [`ElfImage`] into supplemental-page-table entries.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::memory::paging::{PAGE_SIZE, USER_VADDR_BASE};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_SHLIB: u32 = 5;

#[derive(Debug)]
pub enum ExecError {
    FileNotFound,
    InvalidFormat,
    UnsupportedArch,
    UnsupportedType,
    MemoryError,
    ReadError,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::FileNotFound => write!(f, "file not found"),
            ExecError::InvalidFormat => write!(f, "invalid ELF format"),
            ExecError::UnsupportedArch => write!(f, "unsupported architecture"),
            ExecError::UnsupportedType => write!(f, "unsupported ELF type (need ET_EXEC, statically linked)"),
            ExecError::MemoryError => write!(f, "memory allocation error"),
            ExecError::ReadError => write!(f, "file read error"),
        }
    }
}

/// One `PT_LOAD` segment, already validated against the file it came from.
pub struct Segment {
    pub vaddr: u64,
    pub file_offset: usize,
    pub file_size: usize,
    pub mem_size: usize,
    pub writable: bool,
}

pub struct ElfImage {
    pub entry: u64,
    pub segments: Vec<Segment>,
}

struct Ehdr {
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Ehdr {
    fn parse(data: &[u8]) -> Result<Ehdr, ExecError> {
        if data.len() < 64 || data[0..4] != ELF_MAGIC {
            return Err(ExecError::InvalidFormat);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
            return Err(ExecError::UnsupportedArch);
        }
        let e_type = u16::from_le_bytes([data[16], data[17]]);
        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        if e_machine != EM_X86_64 {
            return Err(ExecError::UnsupportedArch);
        }
        if e_type != ET_EXEC {
            return Err(ExecError::UnsupportedType);
        }
        let e_phentsize = u16::from_le_bytes([data[54], data[55]]);
        if e_phentsize as usize != 56 {
            return Err(ExecError::InvalidFormat);
        }
        Ok(Ehdr {
            e_entry: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            e_phoff: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            e_phentsize,
            e_phnum: u16::from_le_bytes([data[56], data[57]]),
        })
    }
}

struct Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

impl Phdr {
    fn parse(data: &[u8]) -> Result<Phdr, ExecError> {
        if data.len() < 56 {
            return Err(ExecError::InvalidFormat);
        }
        Ok(Phdr {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_flags: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            p_offset: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            p_filesz: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(data[40..48].try_into().unwrap()),
        })
    }
}

const PF_W: u32 = 0x2;

/// Parse and fully validate an ELF64 executable image. Rejects anything that
/// would need a loader this kernel doesn't have (dynamic linking,
/// interpreters) or whose segments don't obey the invariants
/// `validate_segment` checks in the reference kernel: offset/vaddr agree mod
/// page size, the file range is in bounds, `memsz >= filesz`, the segment
/// doesn't wrap or straddle the kernel/user split, and page 0 stays
/// unmapped.
pub fn parse(data: &[u8]) -> Result<ElfImage, ExecError> {
    let ehdr = Ehdr::parse(data)?;

    let mut segments = Vec::new();
    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize;
        let phdr_bytes = data.get(off..).ok_or(ExecError::InvalidFormat)?;
        let phdr = Phdr::parse(phdr_bytes)?;

        match phdr.p_type {
            PT_LOAD => {}
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err(ExecError::UnsupportedType),
            _ => continue,
        }

        validate_segment(&phdr, data.len())?;

        segments.push(Segment {
            vaddr: phdr.p_vaddr,
            file_offset: phdr.p_offset as usize,
            file_size: phdr.p_filesz as usize,
            mem_size: phdr.p_memsz as usize,
            writable: phdr.p_flags & PF_W != 0,
        });
    }

    if segments.is_empty() {
        return Err(ExecError::InvalidFormat);
    }
    if ehdr.e_entry < USER_VADDR_BASE {
        return Err(ExecError::InvalidFormat);
    }

    Ok(ElfImage { entry: ehdr.e_entry, segments })
}

fn validate_segment(phdr: &Phdr, file_len: usize) -> Result<(), ExecError> {
    if (phdr.p_offset % PAGE_SIZE) != (phdr.p_vaddr % PAGE_SIZE) {
        return Err(ExecError::InvalidFormat);
    }
    if phdr.p_offset > file_len as u64 {
        return Err(ExecError::InvalidFormat);
    }
    if phdr.p_offset.checked_add(phdr.p_filesz).map_or(true, |end| end > file_len as u64) {
        return Err(ExecError::InvalidFormat);
    }
    if phdr.p_memsz < phdr.p_filesz {
        return Err(ExecError::InvalidFormat);
    }
    if phdr.p_memsz == 0 {
        return Err(ExecError::InvalidFormat);
    }
    if phdr.p_vaddr < USER_VADDR_BASE {
        return Err(ExecError::InvalidFormat);
    }
    let seg_end = phdr.p_vaddr.checked_add(phdr.p_memsz).ok_or(ExecError::InvalidFormat)?;
    if !crate::memory::paging::is_user_addr(phdr.p_vaddr) || !crate::memory::paging::is_user_addr(seg_end.saturating_sub(1).max(phdr.p_vaddr)) {
        return Err(ExecError::InvalidFormat);
    }
    Ok(())
}

pub fn extract_filename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    const EHDR_LEN: usize = 64;
    const PHDR_LEN: usize = 56;
    const EM_386: u16 = 3;
    const ET_DYN: u16 = 3;

    struct TestSeg {
        p_type: u32,
        p_flags: u32,
        p_offset: u64,
        p_vaddr: u64,
        p_filesz: u64,
        p_memsz: u64,
    }

    fn seg(p_type: u32, p_flags: u32, p_offset: u64, p_vaddr: u64, p_filesz: u64, p_memsz: u64) -> TestSeg {
        TestSeg { p_type, p_flags, p_offset, p_vaddr, p_filesz, p_memsz }
    }

    /// Assembles a minimal ELF64 header plus program header table from raw
    /// field values, padding the file out to cover every segment's claimed
    /// file range, byte-for-byte matching the layout `Ehdr::parse`/`Phdr::parse`
    /// read.
    fn build_elf(entry: u64, e_type: u16, e_machine: u16, class: u8, segs: &[TestSeg]) -> Vec<u8> {
        let phoff = EHDR_LEN as u64;
        let phnum = segs.len() as u16;
        let file_len = segs
            .iter()
            .map(|s| s.p_offset + s.p_filesz)
            .max()
            .unwrap_or(0)
            .max(phoff + phnum as u64 * PHDR_LEN as u64) as usize;

        let mut data = vec![0u8; file_len];
        data[0..4].copy_from_slice(&ELF_MAGIC);
        data[4] = class;
        data[5] = ELFDATA2LSB;
        data[16..18].copy_from_slice(&e_type.to_le_bytes());
        data[18..20].copy_from_slice(&e_machine.to_le_bytes());
        data[24..32].copy_from_slice(&entry.to_le_bytes());
        data[32..40].copy_from_slice(&phoff.to_le_bytes());
        data[54..56].copy_from_slice(&(PHDR_LEN as u16).to_le_bytes());
        data[56..58].copy_from_slice(&phnum.to_le_bytes());

        for (i, s) in segs.iter().enumerate() {
            let base = phoff as usize + i * PHDR_LEN;
            data[base..base + 4].copy_from_slice(&s.p_type.to_le_bytes());
            data[base + 4..base + 8].copy_from_slice(&s.p_flags.to_le_bytes());
            data[base + 8..base + 16].copy_from_slice(&s.p_offset.to_le_bytes());
            data[base + 16..base + 24].copy_from_slice(&s.p_vaddr.to_le_bytes());
            data[base + 32..base + 40].copy_from_slice(&s.p_filesz.to_le_bytes());
            data[base + 40..base + 48].copy_from_slice(&s.p_memsz.to_le_bytes());
        }
        data
    }

    fn valid_exec(segs: &[TestSeg]) -> Vec<u8> {
        build_elf(USER_VADDR_BASE, ET_EXEC, EM_X86_64, ELFCLASS64, segs)
    }

    #[test]
    fn parses_valid_single_segment() {
        let data = valid_exec(&[seg(PT_LOAD, 0x4, PAGE_SIZE, USER_VADDR_BASE, 0x10, 0x10)]);
        let image = parse(&data).expect("valid image should parse");
        assert_eq!(image.entry, USER_VADDR_BASE);
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].vaddr, USER_VADDR_BASE);
        assert_eq!(image.segments[0].file_offset, PAGE_SIZE as usize);
        assert_eq!(image.segments[0].file_size, 0x10);
        assert_eq!(image.segments[0].mem_size, 0x10);
        assert!(!image.segments[0].writable);
    }

    #[test]
    fn writable_flag_propagates() {
        let data = valid_exec(&[seg(PT_LOAD, PF_W, PAGE_SIZE, USER_VADDR_BASE, 0x10, 0x10)]);
        let image = parse(&data).unwrap();
        assert!(image.segments[0].writable);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = valid_exec(&[seg(PT_LOAD, 0, PAGE_SIZE, USER_VADDR_BASE, 0x10, 0x10)]);
        data[0] = 0;
        assert!(matches!(parse(&data), Err(ExecError::InvalidFormat)));
    }

    #[test]
    fn rejects_wrong_class() {
        let data = build_elf(USER_VADDR_BASE, ET_EXEC, EM_X86_64, 1, &[seg(PT_LOAD, 0, PAGE_SIZE, USER_VADDR_BASE, 0x10, 0x10)]);
        assert!(matches!(parse(&data), Err(ExecError::UnsupportedArch)));
    }

    #[test]
    fn rejects_wrong_machine() {
        let data = build_elf(USER_VADDR_BASE, ET_EXEC, EM_386, ELFCLASS64, &[seg(PT_LOAD, 0, PAGE_SIZE, USER_VADDR_BASE, 0x10, 0x10)]);
        assert!(matches!(parse(&data), Err(ExecError::UnsupportedArch)));
    }

    #[test]
    fn rejects_non_exec_type() {
        let data = build_elf(USER_VADDR_BASE, ET_DYN, EM_X86_64, ELFCLASS64, &[seg(PT_LOAD, 0, PAGE_SIZE, USER_VADDR_BASE, 0x10, 0x10)]);
        assert!(matches!(parse(&data), Err(ExecError::UnsupportedType)));
    }

    #[test]
    fn rejects_pt_interp_segment() {
        let data = valid_exec(&[
            seg(PT_INTERP, 0, PAGE_SIZE, USER_VADDR_BASE, 0x4, 0x4),
            seg(PT_LOAD, 0, PAGE_SIZE, USER_VADDR_BASE, 0x10, 0x10),
        ]);
        assert!(matches!(parse(&data), Err(ExecError::UnsupportedType)));
    }

    #[test]
    fn rejects_pt_dynamic_segment() {
        let data = valid_exec(&[
            seg(PT_DYNAMIC, 0, PAGE_SIZE, USER_VADDR_BASE, 0x4, 0x4),
            seg(PT_LOAD, 0, PAGE_SIZE, USER_VADDR_BASE, 0x10, 0x10),
        ]);
        assert!(matches!(parse(&data), Err(ExecError::UnsupportedType)));
    }

    #[test]
    fn rejects_misaligned_offset_vaddr() {
        let data = valid_exec(&[seg(PT_LOAD, 0, PAGE_SIZE + 1, USER_VADDR_BASE, 0x10, 0x10)]);
        assert!(matches!(parse(&data), Err(ExecError::InvalidFormat)));
    }

    #[test]
    fn rejects_file_range_out_of_bounds() {
        let mut data = valid_exec(&[seg(PT_LOAD, 0, PAGE_SIZE, USER_VADDR_BASE, 0x10, 0x10)]);
        data.truncate(PAGE_SIZE as usize + 4);
        assert!(matches!(parse(&data), Err(ExecError::InvalidFormat)));
    }

    #[test]
    fn rejects_memsz_less_than_filesz() {
        let data = valid_exec(&[seg(PT_LOAD, 0, PAGE_SIZE, USER_VADDR_BASE, 0x20, 0x10)]);
        assert!(matches!(parse(&data), Err(ExecError::InvalidFormat)));
    }

    #[test]
    fn rejects_zero_memsz() {
        let data = valid_exec(&[seg(PT_LOAD, 0, PAGE_SIZE, USER_VADDR_BASE, 0, 0)]);
        assert!(matches!(parse(&data), Err(ExecError::InvalidFormat)));
    }

    #[test]
    fn rejects_entry_below_user_vaddr_base() {
        let data = build_elf(0, ET_EXEC, EM_X86_64, ELFCLASS64, &[seg(PT_LOAD, 0, PAGE_SIZE, USER_VADDR_BASE, 0x10, 0x10)]);
        assert!(matches!(parse(&data), Err(ExecError::InvalidFormat)));
    }

    #[test]
    fn validate_segment_rejects_vaddr_below_user_base() {
        let phdr = Phdr { p_type: PT_LOAD, p_flags: 0, p_offset: 0, p_vaddr: 0, p_filesz: 0x10, p_memsz: 0x10 };
        assert!(matches!(validate_segment(&phdr, 0x1000), Err(ExecError::InvalidFormat)));
    }

    #[test]
    fn extract_filename_strips_directories() {
        assert_eq!(extract_filename("/bin/echo"), "echo");
        assert_eq!(extract_filename("plain"), "plain");
    }
}
