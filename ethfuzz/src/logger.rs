// Copyright 2021 Michael Rodler
// This file is part of ethfuzz.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! The campaign log: leader dumps and branch summaries written for later inspection. Unlike the
//! `tracing` diagnostics this is part of the campaign output, so it is injected as a [`LogSink`].

use anyhow::Context;
use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::rc::Rc;

pub trait LogSink {
    fn debug(&mut self, msg: &str);
    fn info(&mut self, msg: &str);
}

/// Writes `debug.txt` and `info.txt` into a log directory.
pub struct FileSink {
    debug: BufWriter<File>,
    info: BufWriter<File>,
}

impl FileSink {
    /// Creates `log_dir` if needed and truncates both log files.
    pub fn create(log_dir: &Path) -> anyhow::Result<FileSink> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
        let open = |name: &str| -> anyhow::Result<BufWriter<File>> {
            let path = log_dir.join(name);
            let f = File::create(&path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            anyhow::Result::Ok(BufWriter::new(f))
        };
        anyhow::Result::Ok(FileSink {
            debug: open("debug.txt")?,
            info: open("info.txt")?,
        })
    }

    fn write_line(w: &mut BufWriter<File>, msg: &str) {
        if let Err(e) = writeln!(w, "{}", msg).and_then(|_| w.flush()) {
            tracing::warn!("failed to write campaign log: {}", e);
        }
    }
}

impl LogSink for FileSink {
    fn debug(&mut self, msg: &str) {
        Self::write_line(&mut self.debug, msg);
    }

    fn info(&mut self, msg: &str) {
        Self::write_line(&mut self.info, msg);
    }
}

#[derive(Debug, Default)]
pub struct MemoryLog {
    pub debug: Vec<String>,
    pub info: Vec<String>,
}

/// Keeps all messages in memory. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemorySink(Rc<RefCell<MemoryLog>>);

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::default()
    }

    pub fn debug_lines(&self) -> Vec<String> {
        self.0.borrow().debug.clone()
    }

    pub fn info_lines(&self) -> Vec<String> {
        self.0.borrow().info.clone()
    }
}

impl LogSink for MemorySink {
    fn debug(&mut self, msg: &str) {
        self.0.borrow_mut().debug.push(msg.to_string());
    }

    fn info(&mut self, msg: &str) {
        self.0.borrow_mut().info.push(msg.to_string());
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn debug(&mut self, _msg: &str) {}
    fn info(&mut self, _msg: &str) {}
}
