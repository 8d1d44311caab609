//! In-memory ELF32 core image and its on-disk serialization
//!
//! A core file is a plain ELF with `e_type = ET_CORE`: an ELF header, one
//! program header per segment, and the segment payloads packed back to back.
//! No sections are emitted; GDB only looks at the program headers, the LOAD
//! payloads, and the PT_NOTE contents.

use std::{io::Write, mem::size_of};

use bytemuck::{bytes_of, Pod, Zeroable};
use log::debug;

use crate::error::Error;

/// Core file
pub const ET_CORE: u16 = 0x4;
/// Tensilica Xtensa architecture
pub const EM_XTENSA: u16 = 0x5E;
/// Current ELF version
pub const EV_CURRENT: u32 = 0x1;

/// Loadable segment
pub const PT_LOAD: u32 = 0x1;
/// Auxiliary (note) segment
pub const PT_NOTE: u32 = 0x4;

/// Segment is executable
pub const PF_X: u32 = 0x1;
/// Segment is writable
pub const PF_W: u32 = 0x2;
/// Segment is readable
pub const PF_R: u32 = 0x4;

/// `e_ident` for a 32-bit little-endian ELF, current version, System V ABI.
const ELF_IDENT: [u8; 16] = [0x7F, b'E', b'L', b'F', 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0];

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
struct Elf32FileHeader {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
struct Elf32ProgramHeader {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

/// A program segment of the core image: a payload mapped at a virtual
/// address, with its program-header type and permission flags.
#[derive(Debug, Clone)]
pub struct Segment {
    pub addr: u32,
    pub data: Vec<u8>,
    pub p_type: u32,
    pub flags: u32,
}

impl Segment {
    fn end(&self) -> u32 {
        self.addr + self.data.len() as u32
    }
}

/// An ELF32 core image under construction.
///
/// Created empty, populated segment by segment, then serialized once with
/// [`CoreFile::write`]. Segments are emitted in insertion order.
#[derive(Debug)]
pub struct CoreFile {
    e_type: u16,
    e_machine: u16,
    segments: Vec<Segment>,
}

impl CoreFile {
    pub fn new(e_type: u16, e_machine: u16) -> Self {
        CoreFile {
            e_type,
            e_machine,
            segments: Vec::new(),
        }
    }

    /// All segments added so far, in insertion order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Appends a program segment.
    ///
    /// Memory-bearing segments (`addr != 0`, non-empty) must not overlap an
    /// existing one; the device-side dump writer guarantees disjoint
    /// regions, so a conflict means the dump is corrupted. Segments at
    /// address zero (the note segment) bypass the check.
    pub fn add_segment(
        &mut self,
        addr: u32,
        data: Vec<u8>,
        p_type: u32,
        flags: u32,
    ) -> Result<(), Error> {
        debug!("add segment: addr={addr:#010x} len={}", data.len());

        if addr != 0 && !data.is_empty() {
            let end = addr + data.len() as u32;
            for existing in &self.segments {
                if addr < existing.end() && existing.addr < end {
                    return Err(Error::OverlappingSegment {
                        new: (addr, end - 1),
                        existing: (existing.addr, existing.end() - 1),
                    });
                }
            }
        }

        self.segments.push(Segment {
            addr,
            data,
            p_type,
            flags,
        });

        Ok(())
    }

    /// Appends the accumulated note records as a PT_NOTE segment at virtual
    /// address zero.
    pub fn add_note_segment(&mut self, notes: Vec<u8>) -> Result<(), Error> {
        self.add_segment(0, notes, PT_NOTE, 0)
    }

    /// Serializes the image: ELF header, program header table, then the
    /// segment payloads concatenated without padding.
    ///
    /// The output is deterministic; identical segment lists produce
    /// byte-identical files.
    pub fn write<W: Write>(&self, sink: &mut W) -> Result<(), Error> {
        let ehsize = size_of::<Elf32FileHeader>() as u32;
        let phentsize = size_of::<Elf32ProgramHeader>() as u32;

        let ehdr = Elf32FileHeader {
            e_ident: ELF_IDENT,
            e_type: self.e_type,
            e_machine: self.e_machine,
            e_version: EV_CURRENT,
            e_entry: 0,
            e_phoff: ehsize,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: ehsize as u16,
            e_phentsize: phentsize as u16,
            e_phnum: self.segments.len() as u16,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        };
        sink.write_all(bytes_of(&ehdr))
            .map_err(Error::OutputWriteFailure)?;

        let mut p_offset = ehsize + self.segments.len() as u32 * phentsize;
        for segment in &self.segments {
            let p_filesz = segment.data.len() as u32;
            let phdr = Elf32ProgramHeader {
                p_type: segment.p_type,
                p_offset,
                p_vaddr: segment.addr,
                p_paddr: segment.addr,
                p_filesz,
                p_memsz: p_filesz,
                p_flags: segment.flags,
                p_align: 0,
            };
            sink.write_all(bytes_of(&phdr))
                .map_err(Error::OutputWriteFailure)?;

            p_offset += p_filesz;
        }

        for segment in &self.segments {
            sink.write_all(&segment.data)
                .map_err(Error::OutputWriteFailure)?;
        }

        Ok(())
    }
}
