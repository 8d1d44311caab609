//! Flash dump parsing and core file construction
//!
//! On-flash layout, all fields little-endian:
//!
//! | record      | contents                                             |
//! |-------------|------------------------------------------------------|
//! | header      | start magic, total length, task count, TCB size      |
//! | task × N    | TCB addr, stack top, stack end, TCB image, stack image |
//! | end marker  | end magic                                            |
//!
//! TCB and stack images are stored padded to 4-byte boundaries; the unpadded
//! lengths come from the header's TCB size and from the task's stack
//! pointers.

use std::{io::Write, mem::size_of};

use bytemuck::{Pod, Zeroable};
use log::{debug, info};

use crate::{
    codec::{align4, read_pod},
    elf::{CoreFile, EM_XTENSA, ET_CORE, PF_R, PF_W, PT_LOAD},
    error::Error,
    flash::FlashRead,
    xtensa,
};

/// First word of a valid dump.
pub const COREDUMP_MAGIC_START: u32 = 0xDEAD_BEEF;
/// Word following the last task record.
pub const COREDUMP_MAGIC_END: u32 = 0xACDC_FEED;

/// Dump header at the start of the core dump partition.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub struct CoreDumpHeader {
    pub magic_start: u32,
    pub total_length: u32,
    pub task_count: u32,
    pub tcb_size: u32,
}

/// Per-task record header.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
struct TaskHeader {
    tcb_addr: u32,
    stack_top: u32,
    stack_end: u32,
}

/// A core dump transcoded into an ELF core image.
#[derive(Debug)]
pub struct CoreDump {
    elf: CoreFile,
    task_count: u32,
}

impl CoreDump {
    /// Walks the dump records and builds the core image: two LOAD segments
    /// (TCB, stack) plus one PRSTATUS note per task, the note segment last.
    ///
    /// `failed_task` designates the task whose thread is reported to the
    /// debugger with SIGSEGV; all other tasks carry no signal.
    pub fn parse(reader: &mut dyn FlashRead, failed_task: Option<u32>) -> Result<Self, Error> {
        let mut core_off = 0;

        let header: CoreDumpHeader =
            read_pod(&reader.read(core_off, size_of::<CoreDumpHeader>() as u32)?)?;
        if header.magic_start != COREDUMP_MAGIC_START {
            return Err(Error::BadStartMagic(header.magic_start));
        }
        core_off += size_of::<CoreDumpHeader>() as u32;

        let task_count = header.task_count;
        let tcb_size = header.tcb_size;
        let tcb_size_aligned = align4(tcb_size);
        info!(
            "Found core dump: {} bytes, {task_count} tasks, TCB size {tcb_size}",
            { header.total_length }
        );

        let mut elf = CoreFile::new(ET_CORE, EM_XTENSA);
        let mut notes = Vec::new();

        for i in 0..task_count {
            let task: TaskHeader = read_pod(&reader.read(core_off, size_of::<TaskHeader>() as u32)?)?;
            core_off += size_of::<TaskHeader>() as u32;

            let grows_down = task.stack_end > task.stack_top;
            let stack_len = task.stack_top.abs_diff(task.stack_end);
            let stack_base = task.stack_top.min(task.stack_end);
            let stack_len_aligned = align4(stack_len);
            debug!(
                "task[{i}]: tcb_addr={:#010x} stack_top={:#010x} stack_end={:#010x} stack_len={stack_len}",
                { task.tcb_addr },
                { task.stack_top },
                { task.stack_end },
            );

            let mut tcb = reader.read(core_off, tcb_size_aligned)?;
            tcb.truncate(tcb_size as usize);
            elf.add_segment(task.tcb_addr, tcb, PT_LOAD, PF_R | PF_W)?;
            core_off += tcb_size_aligned;

            let mut stack = reader.read(core_off, stack_len_aligned)?;
            stack.truncate(stack_len as usize);
            core_off += stack_len_aligned;

            let regs = xtensa::registers_from_stack(&stack, grows_down);
            elf.add_segment(stack_base, stack, PT_LOAD, PF_R | PF_W)?;

            let cursig = if failed_task == Some(i) {
                xtensa::SIGSEGV
            } else {
                0
            };
            notes.extend_from_slice(&xtensa::prstatus_note(i, &regs, cursig));
        }

        let magic_end: u32 = read_pod(&reader.read(core_off, 4)?)?;
        if magic_end != COREDUMP_MAGIC_END {
            return Err(Error::BadEndMagic(magic_end));
        }

        elf.add_note_segment(notes)?;

        Ok(CoreDump { elf, task_count })
    }

    /// Number of tasks found in the dump.
    pub fn task_count(&self) -> u32 {
        self.task_count
    }

    /// The transcoded ELF core image.
    pub fn elf(&self) -> &CoreFile {
        &self.elf
    }

    /// Serializes the core file.
    pub fn write<W: Write>(&self, sink: &mut W) -> Result<(), Error> {
        self.elf.write(sink)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::elf::PT_NOTE;

    struct Task {
        tcb_addr: u32,
        stack_top: u32,
        stack_end: u32,
        tcb: Vec<u8>,
        stack: Vec<u8>,
    }

    fn dump_image(tcb_size: u32, tasks: &[Task]) -> Vec<u8> {
        let mut image = Vec::new();
        image.extend_from_slice(&COREDUMP_MAGIC_START.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes()); // patched below
        image.extend_from_slice(&(tasks.len() as u32).to_le_bytes());
        image.extend_from_slice(&tcb_size.to_le_bytes());

        for task in tasks {
            image.extend_from_slice(&task.tcb_addr.to_le_bytes());
            image.extend_from_slice(&task.stack_top.to_le_bytes());
            image.extend_from_slice(&task.stack_end.to_le_bytes());

            image.extend_from_slice(&task.tcb);
            while image.len() % 4 != 0 {
                image.push(0);
            }
            image.extend_from_slice(&task.stack);
            while image.len() % 4 != 0 {
                image.push(0);
            }
        }

        image.extend_from_slice(&COREDUMP_MAGIC_END.to_le_bytes());

        let total = image.len() as u32;
        image[4..8].copy_from_slice(&total.to_le_bytes());
        image
    }

    fn exception_stack(pc: u32, ps: u32, len: usize) -> Vec<u8> {
        let mut stack = vec![0; len];
        stack[0..4].copy_from_slice(&1u32.to_le_bytes());
        stack[4..8].copy_from_slice(&pc.to_le_bytes());
        stack[8..12].copy_from_slice(&ps.to_le_bytes());
        stack
    }

    #[test]
    fn single_exception_task() {
        // stack_end > stack_top: the stack grows down from its end address
        let image = dump_image(
            32,
            &[Task {
                tcb_addr: 0x3FFB_0000,
                stack_top: 0x3FFB_0F00,
                stack_end: 0x3FFB_1000,
                tcb: vec![0; 32],
                stack: exception_stack(0x4000_1234, 0x60, 0x100),
            }],
        );

        let dump = CoreDump::parse(&mut image.as_slice(), None).unwrap();
        assert_eq!(dump.task_count(), 1);

        let segments = dump.elf().segments();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].addr, 0x3FFB_0000);
        assert_eq!(segments[0].data.len(), 32);
        assert_eq!(segments[1].addr, 0x3FFB_0F00);
        assert_eq!(segments[1].data.len(), 0x100);
        assert_eq!(segments[2].p_type, PT_NOTE);

        // the note's register block carries the fixed-up PC and PS
        let desc = &segments[2].data[20..];
        assert_eq!(&desc[72..76], &0x4000_1234u32.to_le_bytes());
        assert_eq!(&desc[76..80], &0x60u32.to_le_bytes());
    }

    #[test]
    fn solicited_task() {
        let mut stack = vec![0u8; 0x100];
        // tag 0, pc, ps, next, a0..a3
        for (i, word) in [0u32, 0x4008_0400, 0x30, 0, 0xA0, 0xA1, 0xA2, 0xA3]
            .iter()
            .enumerate()
        {
            stack[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }

        let image = dump_image(
            32,
            &[Task {
                tcb_addr: 0x3FFB_0000,
                stack_top: 0x3FFB_0F00,
                stack_end: 0x3FFB_1000,
                tcb: vec![0; 32],
                stack,
            }],
        );

        let dump = CoreDump::parse(&mut image.as_slice(), None).unwrap();
        let desc = &dump.elf().segments()[2].data[20..];
        assert_eq!(&desc[72..76], &0x4008_0400u32.to_le_bytes());
        // AR0..AR3 live at words 64..68 of the register block
        assert_eq!(&desc[72 + 64 * 4..72 + 65 * 4], &0xA0u32.to_le_bytes());
        assert_eq!(&desc[72 + 67 * 4..72 + 68 * 4], &0xA3u32.to_le_bytes());
    }

    #[test]
    fn bad_start_magic() {
        let mut image = dump_image(32, &[]);
        image[0..4].copy_from_slice(&0xDEAD_BEEEu32.to_le_bytes());

        assert!(matches!(
            CoreDump::parse(&mut image.as_slice(), None),
            Err(Error::BadStartMagic(0xDEAD_BEEE))
        ));
    }

    #[test]
    fn bad_end_magic() {
        let mut image = dump_image(32, &[]);
        let len = image.len();
        image[len - 4..].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());

        assert!(matches!(
            CoreDump::parse(&mut image.as_slice(), None),
            Err(Error::BadEndMagic(0xFFFF_FFFF))
        ));
    }

    #[test]
    fn overlapping_tasks_are_rejected() {
        let task = || Task {
            tcb_addr: 0x3FFB_0000,
            stack_top: 0x3FFB_0F00,
            stack_end: 0x3FFB_1000,
            tcb: vec![0; 32],
            stack: vec![0; 0x100],
        };
        let mut second = task();
        second.stack_top = 0x3FFB_2F00;
        second.stack_end = 0x3FFB_3000;

        let image = dump_image(32, &[task(), second]);
        assert!(matches!(
            CoreDump::parse(&mut image.as_slice(), None),
            Err(Error::OverlappingSegment { .. })
        ));
    }

    #[test]
    fn zero_tasks() {
        let image = dump_image(32, &[]);
        let dump = CoreDump::parse(&mut image.as_slice(), None).unwrap();

        assert_eq!(dump.task_count(), 0);
        let segments = dump.elf().segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].p_type, PT_NOTE);
        assert!(segments[0].data.is_empty());
    }

    #[test]
    fn unaligned_tcb_is_truncated() {
        let image = dump_image(
            30,
            &[Task {
                tcb_addr: 0x3FFB_0000,
                stack_top: 0x3FFB_0F00,
                stack_end: 0x3FFB_1000,
                tcb: vec![0xAB; 30],
                stack: vec![0; 0x100],
            }],
        );

        let dump = CoreDump::parse(&mut image.as_slice(), None).unwrap();
        let segments = dump.elf().segments();
        // the segment carries the unpadded TCB, but the walk advanced by
        // the aligned length: the stack still parses
        assert_eq!(segments[0].data, vec![0xAB; 30]);
        assert_eq!(segments[1].data.len(), 0x100);
    }

    #[test]
    fn upward_stack_still_produces_segments() {
        // stack_end < stack_top encodes an upward-growing stack; registers
        // come back zeroed but both segments are still written
        let image = dump_image(
            32,
            &[Task {
                tcb_addr: 0x3FFB_0000,
                stack_top: 0x3FFB_1000,
                stack_end: 0x3FFB_0F00,
                tcb: vec![0; 32],
                stack: exception_stack(0x4000_1234, 0x60, 0x100),
            }],
        );

        let dump = CoreDump::parse(&mut image.as_slice(), None).unwrap();
        let segments = dump.elf().segments();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[1].addr, 0x3FFB_0F00);

        let desc = &segments[2].data[20..];
        assert_eq!(&desc[72..76], &0u32.to_le_bytes());
    }

    #[test]
    fn failed_task_gets_sigsegv() {
        let image = dump_image(
            32,
            &[Task {
                tcb_addr: 0x3FFB_0000,
                stack_top: 0x3FFB_0F00,
                stack_end: 0x3FFB_1000,
                tcb: vec![0; 32],
                stack: vec![0; 0x100],
            }],
        );

        let dump = CoreDump::parse(&mut image.as_slice(), Some(0)).unwrap();
        let desc = &dump.elf().segments()[2].data[20..];
        assert_eq!(&desc[12..14], &xtensa::SIGSEGV.to_le_bytes());

        let dump = CoreDump::parse(&mut image.as_slice(), Some(1)).unwrap();
        let desc = &dump.elf().segments()[2].data[20..];
        assert_eq!(&desc[12..14], &0u16.to_le_bytes());
    }

    #[test]
    fn truncated_dump_is_malformed() {
        let image = dump_image(
            32,
            &[Task {
                tcb_addr: 0x3FFB_0000,
                stack_top: 0x3FFB_0F00,
                stack_end: 0x3FFB_1000,
                tcb: vec![0; 32],
                stack: vec![0; 0x100],
            }],
        );
        // drop the end marker and part of the stack
        let image = &image[..image.len() - 64];

        assert!(matches!(
            CoreDump::parse(&mut &*image, None),
            Err(Error::MalformedInput { .. })
        ));
    }
}
