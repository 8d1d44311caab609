//! Xtensa per-task state reconstruction
//!
//! GDB's Xtensa backend expects each thread's registers as a fixed 129-word
//! vector (the `xtensa_elf_gregset_t` layout from `gdb/xtensa-tdep.h`)
//! delivered in an NT_PRSTATUS note. The dump itself does not store register
//! files; it stores raw stack images, and the registers live in the frame
//! the RTOS or the exception vector pushed at the stack pointer. Two frame
//! shapes exist, distinguished by their first word: a hardware exception
//! frame (non-zero exit tag) and a solicited context-switch frame (zero
//! tag).

use std::mem::size_of;

use bytemuck::{bytes_of, Pod, Zeroable};
use log::{debug, warn};

use crate::codec::{pad4, read_words};

/// Number of words in the register vector.
///
/// `xtensa_elf_gregset_t` declares 128, but GDB refuses to read the note
/// unless one more trailing word is present.
pub const GREG_COUNT: usize = 129;

const REG_PC: usize = 0;
const REG_PS: usize = 1;
const REG_LBEG: usize = 2;
const REG_LEND: usize = 3;
const REG_LCOUNT: usize = 4;
const REG_SAR: usize = 5;
const REG_AR_BASE: usize = 64;

// Exception frame pushed by the trap vectors (XT_STK_* layout).
const XT_STK_EXIT: usize = 0;
const XT_STK_PC: usize = 1;
const XT_STK_PS: usize = 2;
const XT_STK_AR_BASE: usize = 3;
const XT_STK_AR_NUM: usize = 16;
const XT_STK_SAR: usize = 19;
const XT_STK_EXCCAUSE: usize = 20;
const XT_STK_EXCVADDR: usize = 21;
const XT_STK_LBEG: usize = 22;
const XT_STK_LEND: usize = 23;
const XT_STK_LCOUNT: usize = 24;
const XT_STK_FRMSZ: usize = 25;

// Solicited frame pushed on a cooperative context switch (XT_SOL_* layout).
const XT_SOL_PC: usize = 1;
const XT_SOL_PS: usize = 2;
const XT_SOL_NEXT: usize = 3;
const XT_SOL_AR_BASE: usize = 4;
const XT_SOL_AR_NUM: usize = 4;

/// NT_PRSTATUS note type.
pub const NT_PRSTATUS: u32 = 1;
/// Signal reported for a task designated as the faulting one.
pub const SIGSEGV: u16 = 11;

const NOTE_NAME: &[u8] = b"CORE\0";

/// Reconstructs the register vector from a task's raw stack image.
///
/// Returns an all-zero vector (with a warning) when the frame cannot be
/// interpreted: upward-growing stacks are not supported, and a stack
/// shorter than the exception frame holds no usable state.
pub fn registers_from_stack(data: &[u8], grows_down: bool) -> [u32; GREG_COUNT] {
    let mut regs = [0u32; GREG_COUNT];

    if !grows_down {
        warn!("Growing up stacks are not supported for now");
        return regs;
    }

    let frame = match read_words(data, XT_STK_FRMSZ) {
        Ok(frame) => frame,
        Err(_) => {
            warn!("Too small stack to keep frame: {} bytes", data.len());
            return regs;
        }
    };

    // Stack frame type indicator is always the first item
    let rc = frame[XT_STK_EXIT];
    if rc != 0 {
        debug!(
            "exception frame: exit={rc:#x} exccause={} excvaddr={:#x}",
            frame[XT_STK_EXCCAUSE], frame[XT_STK_EXCVADDR]
        );
        regs[REG_PC] = frame[XT_STK_PC];
        regs[REG_PS] = frame[XT_STK_PS];
        regs[REG_AR_BASE..REG_AR_BASE + XT_STK_AR_NUM]
            .copy_from_slice(&frame[XT_STK_AR_BASE..XT_STK_AR_BASE + XT_STK_AR_NUM]);
        regs[REG_SAR] = frame[XT_STK_SAR];
        regs[REG_LBEG] = frame[XT_STK_LBEG];
        regs[REG_LEND] = frame[XT_STK_LEND];
        regs[REG_LCOUNT] = frame[XT_STK_LCOUNT];
    } else {
        debug!("solicited frame: next={:#x}", frame[XT_SOL_NEXT]);
        regs[REG_PC] = frame[XT_SOL_PC];
        regs[REG_PS] = frame[XT_SOL_PS];
        regs[REG_AR_BASE..REG_AR_BASE + XT_SOL_AR_NUM]
            .copy_from_slice(&frame[XT_SOL_AR_BASE..XT_SOL_AR_BASE + XT_SOL_AR_NUM]);
    }

    // The saved PC carries the window-call encoding in its top bits; map it
    // back into the instruction address space. A0 holds the return address
    // and needs the same treatment when its MSB is set.
    regs[REG_PC] = fixup_code_address(regs[REG_PC]);
    if regs[REG_AR_BASE] & 0x8000_0000 != 0 {
        regs[REG_AR_BASE] = fixup_code_address(regs[REG_AR_BASE]);
    }

    regs
}

fn fixup_code_address(addr: u32) -> u32 {
    (addr & 0x3FFF_FFFF) | 0x4000_0000
}

/// Thread status record preceding the register block in an NT_PRSTATUS
/// note. Of all the fields only `pr_cursig` and `pr_pid` are read by BFD;
/// see `elf32-xtensa.c` in libbfd.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
struct XtensaPrStatus {
    si_signo: u32,
    si_code: u32,
    si_errno: u32,
    pr_cursig: u16,
    pr_pad0: u16,
    pr_sigpend: u32,
    pr_sighold: u32,
    pr_pid: u32,
    pr_ppid: u32,
    pr_pgrp: u32,
    pr_sid: u32,
    pr_utime: u64,
    pr_stime: u64,
    pr_cutime: u64,
    pr_cstime: u64,
}

/// Builds the NT_PRSTATUS note for one task: the prstatus record followed
/// by the register vector, wrapped in a `"CORE"` note with 4-byte padding.
pub fn prstatus_note(task_index: u32, regs: &[u32; GREG_COUNT], cursig: u16) -> Vec<u8> {
    let mut prstatus = XtensaPrStatus::zeroed();
    prstatus.pr_cursig = cursig;
    prstatus.pr_pid = task_index;

    let mut desc = Vec::with_capacity(size_of::<XtensaPrStatus>() + GREG_COUNT * 4);
    desc.extend_from_slice(bytes_of(&prstatus));
    for reg in regs {
        desc.extend_from_slice(&reg.to_le_bytes());
    }

    encode_note(NOTE_NAME, NT_PRSTATUS, &desc)
}

/// Formats one ELF note record. All note records are concatenated into a
/// single PT_NOTE segment.
fn encode_note(name: &[u8], n_type: u32, desc: &[u8]) -> Vec<u8> {
    let mut note = Vec::with_capacity(12 + name.len() + desc.len() + 6);
    note.extend_from_slice(&(name.len() as u32).to_le_bytes());
    note.extend_from_slice(&(desc.len() as u32).to_le_bytes());
    note.extend_from_slice(&n_type.to_le_bytes());
    note.extend_from_slice(name);
    pad4(&mut note);
    note.extend_from_slice(desc);
    pad4(&mut note);
    note
}
