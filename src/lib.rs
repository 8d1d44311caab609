//! Extract and analyze core dumps persisted to flash by ESP32 firmware.
//!
//! When an ESP-IDF application panics or hits a fatal exception, the panic
//! handler can write a compact snapshot of every task's TCB and stack to a
//! dedicated flash partition. This crate reads that snapshot back out of the
//! device, reconstructs per-task register state from the saved stack frames,
//! and emits a standard ELF core file that `xtensa-esp32-elf-gdb` loads with
//! `--core`, so post-mortem debugging works exactly like it does for a
//! process core on the host.

pub mod cli;
pub mod codec;
pub mod coredump;
pub mod elf;
pub mod error;
pub mod flash;
pub mod xtensa;

pub use self::{coredump::CoreDump, error::Error, flash::FlashRead};

pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
