//! Process-wide protocol writer

use crate::error::{CollectorError, Result};
use crate::observability::RuntimeMetrics;
use std::io::Write;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Serialises job blocks onto the parent's pipe.
///
/// Each block is written with a single `write_all` and flushed while the
/// lock is held, so blocks from different jobs never interleave.
pub struct Emitter {
    out: Mutex<Box<dyn Write + Send>>,
    fatal: CancellationToken,
    metrics: RuntimeMetrics,
}

impl Emitter {
    /// Emitter over any writer. `fatal` is cancelled when a write fails.
    pub fn new(out: Box<dyn Write + Send>, fatal: CancellationToken) -> Self {
        Self {
            out: Mutex::new(out),
            fatal,
            metrics: RuntimeMetrics::new(),
        }
    }

    pub fn stdout(fatal: CancellationToken) -> Self {
        Self::new(Box::new(std::io::stdout()), fatal)
    }

    /// Write one block. An empty block is a no-op.
    pub fn emit(&self, block: &str) -> Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        if self.fatal.is_cancelled() {
            return Err(CollectorError::Fatal("output closed".into()));
        }

        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let written = out
            .write_all(block.as_bytes())
            .and_then(|()| out.flush());

        match written {
            Ok(()) => {
                self.metrics.add_emitted_bytes(block.len() as u64);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to write to parent, shutting down");
                self.fatal.cancel();
                Err(CollectorError::Fatal(format!("write to parent failed: {e}")))
            }
        }
    }

    /// Token cancelled once output is lost
    pub fn fatal_token(&self) -> &CancellationToken {
        &self.fatal
    }
}


#[cfg(test)]
mod tests {
    use super::testing::SharedBuffer;
    use super::*;
    use std::sync::Arc;

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_emit_writes_block() {
        let buf = SharedBuffer::default();
        let emitter = Emitter::new(Box::new(buf.clone()), CancellationToken::new());
        emitter.emit("BEGIN 'a.b'\nSET 'x' = 1\nEND\n").unwrap();
        emitter.emit("").unwrap();
        assert_eq!(buf.lines(), vec!["BEGIN 'a.b'", "SET 'x' = 1", "END"]);
    }

    #[test]
    fn test_write_failure_is_fatal() {
        let fatal = CancellationToken::new();
        let emitter = Emitter::new(Box::new(BrokenPipe), fatal.clone());

        let err = emitter.emit("END\n").unwrap_err();
        assert!(matches!(err, CollectorError::Fatal(_)));
        assert!(fatal.is_cancelled());
        assert!(emitter.emit("END\n").is_err());
    }

    #[test]
    fn test_concurrent_blocks_do_not_interleave() {
        let buf = SharedBuffer::default();
        let emitter = Arc::new(Emitter::new(Box::new(buf.clone()), CancellationToken::new()));

        let handles: Vec<_> = (0..8)
            .map(|job| {
                let emitter = emitter.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let block = format!("BEGIN 'job{job}.c'\nSET 'd' = {job}\nEND\n");
                        emitter.emit(&block).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let lines = buf.lines();
        assert_eq!(lines.len(), 8 * 50 * 3);
        for block in lines.chunks(3) {
            let job = block[0]
                .trim_start_matches("BEGIN 'job")
                .trim_end_matches(".c'");
            assert_eq!(block[1], format!("SET 'd' = {job}"));
            assert_eq!(block[2], "END");
        }
    }
}
