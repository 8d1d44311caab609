//! Device flash access
//!
//! The dump is fetched off the device with `esptool` rather than by speaking
//! the serial protocol ourselves: each [`EsptoolReader::fetch`] invocation
//! shells out to `esptool.py read_flash` per 8 KiB block, reads the block
//! back out of a temporary file, and serves byte ranges from the assembled
//! buffer. The dump's own length field (read from the first block) bounds
//! how much flash is transferred.

use std::{fs, process::Command};

use log::debug;
use strum::{Display, EnumString, VariantNames};
use tempfile::NamedTempFile;

use crate::{
    codec::read_pod,
    coredump::{CoreDumpHeader, COREDUMP_MAGIC_START},
    error::Error,
};

/// Block size used when reading the dump out of flash.
pub const FLASH_READ_BLOCK_SZ: u32 = 0x2000;

const ESPTOOL: &str = "esptool.py";

/// Supported target chips
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, VariantNames, clap::ValueEnum,
)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
pub enum Chip {
    /// ESP32
    #[default]
    Esp32,
}

/// A source of raw bytes from the device's flash.
///
/// Implementations must return exactly `len` bytes or fail. The dump parser
/// issues reads at monotonically increasing offsets relative to the start of
/// the core dump partition.
pub trait FlashRead {
    fn read(&mut self, offset: u32, len: u32) -> Result<Vec<u8>, Error>;
}

/// Serves reads from an in-memory flash image, e.g. a partition dumped to a
/// file earlier.
impl FlashRead for &[u8] {
    fn read(&mut self, offset: u32, len: u32) -> Result<Vec<u8>, Error> {
        let start = offset as usize;
        let end = start + len as usize;
        if end > self.len() {
            return Err(Error::MalformedInput {
                expected: len as usize,
                actual: self.len().saturating_sub(start),
            });
        }

        Ok(self[start..end].to_vec())
    }
}

/// Reads the core dump partition through an `esptool` subprocess.
#[derive(Debug)]
pub struct EsptoolReader {
    data: Vec<u8>,
}

impl EsptoolReader {
    /// Fetches the core dump from the device, starting at partition offset
    /// `off`.
    ///
    /// The first block must start with a valid dump header; its
    /// `total_length` field determines how many further blocks to transfer.
    pub fn fetch(
        chip: Chip,
        port: Option<&str>,
        baud: Option<u32>,
        off: u32,
    ) -> Result<Self, Error> {
        let mut data = Vec::new();
        let mut read_off = off;
        let mut read_sz = FLASH_READ_BLOCK_SZ;
        let mut dump_sz = 0;

        loop {
            let block = read_flash_block(chip, port, baud, read_off, read_sz)?;
            data.extend_from_slice(&block);

            if dump_sz == 0 {
                let header: CoreDumpHeader = read_pod(&data)?;
                if header.magic_start != COREDUMP_MAGIC_START {
                    return Err(Error::BadStartMagic(header.magic_start));
                }
                dump_sz = header.total_length;
                debug!("core dump is {dump_sz} bytes");
            }

            if data.len() as u32 >= dump_sz {
                break;
            }

            read_off += read_sz;
            read_sz = (dump_sz - data.len() as u32).min(FLASH_READ_BLOCK_SZ);
        }

        Ok(EsptoolReader { data })
    }
}

impl FlashRead for EsptoolReader {
    fn read(&mut self, offset: u32, len: u32) -> Result<Vec<u8>, Error> {
        (&mut &self.data[..]).read(offset, len)
    }
}

fn read_flash_block(
    chip: Chip,
    port: Option<&str>,
    baud: Option<u32>,
    offset: u32,
    len: u32,
) -> Result<Vec<u8>, Error> {
    let tmp = NamedTempFile::new()?;

    let mut command = Command::new(ESPTOOL);
    command.arg("-c").arg(chip.to_string());
    if let Some(port) = port {
        command.arg("-p").arg(port);
    }
    if let Some(baud) = baud {
        command.arg("-b").arg(baud.to_string());
    }
    command
        .arg("read_flash")
        .arg(offset.to_string())
        .arg(len.to_string())
        .arg(tmp.path());

    debug!("running {command:?}");
    let output = command.output().map_err(|source| Error::Spawn {
        executable: ESPTOOL.into(),
        source,
    })?;
    if !output.status.success() {
        return Err(Error::FlashReadFailure(
            String::from_utf8_lossy(&output.stderr).trim().into(),
        ));
    }

    let data = fs::read(tmp.path())?;
    if data.len() != len as usize {
        return Err(Error::FlashReadFailure(format!(
            "read {} bytes from flash, expected {len}",
            data.len()
        )));
    }

    Ok(data)
}
