//! Adapts the `log` facade onto the platform's pre-formatted string sink.

use {
    crate::platform,
    core::fmt::Write,
    log::{LevelFilter, Log, Metadata, Record},
};

struct PlatformLogger;

/// Fixed-size formatting buffer; the sink takes a finished line and the
/// VM-exit path must not allocate.
struct LineBuffer {
    buf: [u8; 512],
    len: usize,
}

impl LineBuffer {
    const fn new() -> Self {
        Self { buf: [0; 512], len: 0 }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("<malformed log line>")
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let remaining = self.buf.len() - self.len;
        let n = s.len().min(remaining);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

impl Log for PlatformLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        platform::try_ops().is_some()
    }

    fn log(&self, record: &Record) {
        let Some(ops) = platform::try_ops() else {
            return;
        };

        let mut line = LineBuffer::new();
        let _ = write!(line, "[{}] {}: {}", record.level(), record.target(), record.args());
        (ops.log_write)(line.as_str());
    }

    fn flush(&self) {}
}

static LOGGER: PlatformLogger = PlatformLogger;

/// Routes the `log` macros to the platform sink. Call once from the driver,
/// after `platform::init`.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_truncates() {
        let mut line = LineBuffer::new();
        for _ in 0..64 {
            let _ = write!(line, "0123456789abcdef");
        }
        assert_eq!(line.as_str().len(), 512);
    }
}
