//! Library and application errors

use std::io;

use miette::Diagnostic;
use thiserror::Error;

/// All possible errors returned by espcoredump
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("No core dump found in flash: invalid start magic {0:#010x}")]
    #[diagnostic(
        code(espcoredump::bad_start_magic),
        help("Verify the core dump partition offset (`--off`), and that the \
              firmware actually persisted a dump")
    )]
    BadStartMagic(u32),

    #[error("Core dump end marker is invalid: {0:#010x}")]
    #[diagnostic(
        code(espcoredump::bad_end_magic),
        help("The dump appears truncated or corrupted; it may have been \
              interrupted while being written")
    )]
    BadEndMagic(u32),

    #[error("Malformed core dump: expected {expected} bytes, got {actual}")]
    #[diagnostic(code(espcoredump::malformed_input))]
    MalformedInput { expected: usize, actual: usize },

    #[error(
        "Can not add overlapping region [{:#x}..{:#x}] to ELF file, conflicts with existing [{:#x}..{:#x}]",
        new.0, new.1, existing.0, existing.1
    )]
    #[diagnostic(code(espcoredump::overlapping_segment))]
    OverlappingSegment { new: (u32, u32), existing: (u32, u32) },

    #[error("Task {0} declares an upward-growing stack")]
    #[diagnostic(code(espcoredump::unsupported_stack_growth))]
    UnsupportedStackGrowth(u32),

    #[error("Failed to read device flash: {0}")]
    #[diagnostic(
        code(espcoredump::flash_read),
        help("Check that the device is connected and that esptool is on your PATH")
    )]
    FlashReadFailure(String),

    #[error("Failed to write core file")]
    #[diagnostic(code(espcoredump::output_write))]
    OutputWriteFailure(#[source] io::Error),

    #[error("Failed to launch '{executable}'")]
    #[diagnostic(code(espcoredump::spawn))]
    Spawn {
        executable: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    #[diagnostic(code(espcoredump::io_error))]
    IoError(#[from] io::Error),
}
