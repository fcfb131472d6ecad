//! Line-prefixed output for tasks running side by side.
//!
//! Every task gets its own [`PrefixedWriter`]. Writers buffer partial lines
//! and emit only complete lines, each under a lock shared by the whole
//! [`WriterGroup`], so lines from different tasks never interleave mid-line.

use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex};

use crossterm::style::{Color, Stylize};

pub type SharedSink = Arc<Mutex<Box<dyn Write + Send>>>;

const PALETTE: [Color; 10] = [
    Color::Cyan,
    Color::Yellow,
    Color::Green,
    Color::Magenta,
    Color::Blue,
    Color::Red,
    Color::DarkCyan,
    Color::DarkYellow,
    Color::DarkGreen,
    Color::DarkMagenta,
];

fn lock_err() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "output lock poisoned")
}

/// Factory for writers sharing one sink and one prefix width.
pub struct WriterGroup {
    out: SharedSink,
    width: usize,
    color: bool,
    next_color: usize,
}

impl WriterGroup {
    pub fn new(out: Box<dyn Write + Send>, names: &[&str], color: bool) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
            width: names.iter().map(|n| n.chars().count()).max().unwrap_or(0),
            color,
            next_color: 0,
        }
    }

    /// Group writing to stdout, colored when stdout is a terminal.
    pub fn stdout(names: &[&str]) -> Self {
        let color = io::stdout().is_terminal();
        Self::new(Box::new(io::stdout()), names, color)
    }

    pub fn writer(&mut self, name: &str) -> PrefixedWriter {
        let padded = format!("{:<width$}", name, width = self.width);
        let prefix = if self.color {
            let color = PALETTE[self.next_color % PALETTE.len()];
            self.next_color += 1;
            format!("{} | ", padded.with(color))
        } else {
            format!("{} | ", padded)
        };
        PrefixedWriter {
            out: self.out.clone(),
            prefix,
            buf: Vec::new(),
        }
    }

    /// Writer for lines that belong to no single task.
    pub fn unprefixed(&self) -> PrefixedWriter {
        PrefixedWriter {
            out: self.out.clone(),
            prefix: String::new(),
            buf: Vec::new(),
        }
    }
}

pub struct PrefixedWriter {
    out: SharedSink,
    prefix: String,
    buf: Vec<u8>,
}

impl PrefixedWriter {
    fn emit(&self, line: &[u8]) -> io::Result<()> {
        let mut out = self.out.lock().map_err(|_| lock_err())?;
        out.write_all(self.prefix.as_bytes())?;
        out.write_all(line)?;
        if !line.ends_with(b"\n") {
            out.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Emit any buffered partial line, terminated with a newline.
    pub fn finish(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.emit(&rest)?;
        }
        self.flush()
    }
}

impl Write for PrefixedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.emit(&line)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.lock().map_err(|_| lock_err())?.flush()
    }
}

impl Drop for PrefixedWriter {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

/// In-memory sink that can be cloned and inspected after writers are done.
#[derive(Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        let bytes = self.0.lock().map(|b| b.clone()).unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.lock().map_err(|_| lock_err())?.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
