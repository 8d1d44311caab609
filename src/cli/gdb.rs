//! GDB process control and GDB/MI v2 record parsing
//!
//! `info-corefile` drives GDB in machine-interface mode: commands go in as
//! `-interpreter-exec console "..."`, and replies come back as a stream of
//! tagged records terminated by a `(gdb)` prompt line. Only two record
//! classes matter here: result records (`^done`, `^error`, ...) which tell
//! us whether a command succeeded, and console stream records (`~"..."`)
//! which carry the human-readable output.

use std::{
    io::{BufRead, BufReader, Write},
    path::Path,
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
};

use log::{debug, warn};

use crate::error::Error;

/// Result classes of a GDB/MI result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

impl ResultClass {
    fn parse(record: &str) -> Option<Self> {
        let class = match record.split(',').next().unwrap_or(record) {
            "done" => ResultClass::Done,
            "running" => ResultClass::Running,
            "connected" => ResultClass::Connected,
            "error" => ResultClass::Error,
            "exit" => ResultClass::Exit,
            other => {
                warn!("Unknown result record: '^{other}'");
                return None;
            }
        };

        Some(class)
    }
}

/// Launches an interactive GDB session on the core file, inheriting the
/// terminal, and waits for it to exit.
pub fn run_interactive(gdb: &str, core: &Path, prog: &Path) -> Result<(), Error> {
    let mut child = Command::new(gdb)
        .arg("--nw") // ignore .gdbinit
        .arg(format!("--core={}", core.display()))
        .arg(prog)
        .spawn()
        .map_err(|source| Error::Spawn {
            executable: gdb.into(),
            source,
        })?;

    child.wait()?;

    Ok(())
}

/// A GDB child process driven over GDB/MI v2.
pub struct GdbMi {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl GdbMi {
    /// Spawns GDB on the core file in MI mode and consumes its start-up
    /// output.
    pub fn spawn(gdb: &str, core: &Path, prog: &Path) -> Result<Self, Error> {
        let mut child = Command::new(gdb)
            .arg("--quiet") // inhibit dumping info at start-up
            .arg("--nx") // inhibit window interface
            .arg("--nw") // ignore .gdbinit
            .arg("--interpreter=mi2")
            .arg(format!("--core={}", core.display()))
            .arg(prog)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| Error::Spawn {
                executable: gdb.into(),
                source,
            })?;

        let stdin = child.stdin.take().unwrap();
        let stdout = BufReader::new(child.stdout.take().unwrap());

        let mut session = GdbMi {
            child,
            stdin,
            stdout,
        };
        session.read_to_prompt(&mut |_| {})?;

        Ok(session)
    }

    /// Issues a console command and streams its console output through
    /// `console`. Returns the command's result class.
    pub fn console_command(
        &mut self,
        command: &str,
        console: &mut dyn FnMut(&str),
    ) -> Result<ResultClass, Error> {
        debug!("gdb/mi: {command}");
        writeln!(self.stdin, "-interpreter-exec console \"{command}\"")?;

        self.read_to_prompt(console)
    }

    /// Reads records until the `(gdb)` prompt (or EOF), dispatching console
    /// stream records to `console`. Returns the last result class seen.
    fn read_to_prompt(&mut self, console: &mut dyn FnMut(&str)) -> Result<ResultClass, Error> {
        let mut result = ResultClass::Done;

        loop {
            let mut line = String::new();
            if self.stdout.read_line(&mut line)? == 0 {
                break;
            }

            let line = line.trim_end_matches(['\n', '\r', ' ']);
            if line == "(gdb)" || line.is_empty() {
                break;
            }

            if let Some(record) = line.strip_prefix('^') {
                if let Some(class) = ResultClass::parse(record) {
                    result = class;
                }
            } else if let Some(record) = line.strip_prefix('~') {
                console(&unescape(record));
            } else {
                debug!("gdb/mi: skipping '{line}'");
            }
        }

        Ok(result)
    }
}

impl Drop for GdbMi {
    fn drop(&mut self) {
        let _ignored = self.child.kill();
        let _ignored = self.child.wait();
    }
}

/// Strips the quotes from a console stream record and expands the C-string
/// escapes GDB uses in it.
fn unescape(record: &str) -> String {
    record
        .trim_matches('"')
        .replace("\\n", "\n")
        .replace("\\t", "\t")
        .replace("\\\"", "\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_result_classes() {
        assert_eq!(ResultClass::parse("done"), Some(ResultClass::Done));
        assert_eq!(
            ResultClass::parse("done,bkpt={number=\"1\"}"),
            Some(ResultClass::Done)
        );
        assert_eq!(
            ResultClass::parse("error,msg=\"No such file\""),
            Some(ResultClass::Error)
        );
        assert_eq!(ResultClass::parse("borked"), None);
    }

    #[test]
    fn unescapes_console_records() {
        assert_eq!(unescape("\"#0  main ()\\n\""), "#0  main ()\n");
        assert_eq!(unescape("\"a\\tb \\\"c\\\"\""), "a\tb \"c\"");
    }
}
