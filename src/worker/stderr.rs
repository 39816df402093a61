//! Bounded capture of worker stderr.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tracing::trace;

use crate::events::{EventBus, EventContext, EventKind};

/// Default number of stderr bytes kept per worker (16KB).
pub const DEFAULT_STDERR_CAPACITY: usize = 16 * 1024;

/// Ring buffer holding the most recent stderr output; oldest bytes drop first.
#[derive(Debug)]
pub struct ErrBuffer {
    data: Mutex<VecDeque<u8>>,
    capacity: usize,
}

impl Default for ErrBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_STDERR_CAPACITY)
    }
}

impl ErrBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
        }
    }

    pub fn write(&self, chunk: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        let chunk = if chunk.len() > self.capacity {
            &chunk[chunk.len() - self.capacity..]
        } else {
            chunk
        };
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let overflow = (data.len() + chunk.len()).saturating_sub(self.capacity);
        data.drain(..overflow);
        data.extend(chunk);
    }

    pub fn len(&self) -> usize {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the buffered output, lossily decoded.
    pub fn snapshot(&self) -> String {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let (a, b) = data.as_slices();
        let mut bytes = Vec::with_capacity(a.len() + b.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Longest stderr chunk announced in a single event.
const MAX_EVENT_OUTPUT: usize = 4096;

/// Spawn the thread that drains a worker's stderr until EOF.
///
/// Output lands in `buffer` as soon as it is read. Events carry one line
/// each, or `MAX_EVENT_OUTPUT` bytes of a line with no newline in sight.
pub fn spawn_drain<R>(
    pid: u32,
    mut source: R,
    buffer: Arc<ErrBuffer>,
    events: EventBus,
) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("stderr-{}", pid))
        .spawn(move || {
            let emit = |output: &[u8]| {
                events.emit(
                    EventKind::WorkerStderr,
                    EventContext::Stderr {
                        pid,
                        output: String::from_utf8_lossy(output).into_owned(),
                    },
                );
            };

            let mut chunk = [0u8; 4096];
            let mut line: Vec<u8> = Vec::with_capacity(MAX_EVENT_OUTPUT);
            loop {
                let n = match source.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        trace!(pid, error = %e, "stderr drain stopped");
                        break;
                    }
                };
                buffer.write(&chunk[..n]);

                for &byte in &chunk[..n] {
                    line.push(byte);
                    if byte == b'\n' || line.len() >= MAX_EVENT_OUTPUT {
                        emit(&line);
                        line.clear();
                    }
                }
            }
            if !line.is_empty() {
                emit(&line);
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_buffer_keeps_recent_bytes() {
        let buf = ErrBuffer::new(8);
        buf.write(b"abcdef");
        buf.write(b"ghij");
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.snapshot(), "cdefghij");
    }

    #[test]
    fn test_oversized_chunk_keeps_tail() {
        let buf = ErrBuffer::new(4);
        buf.write(b"0123456789");
        assert_eq!(buf.snapshot(), "6789");
    }

    #[test]
    fn test_zero_capacity_discards() {
        let buf = ErrBuffer::new(0);
        buf.write(b"lost");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drain_collects_lines_and_emits() {
        let buffer = Arc::new(ErrBuffer::default());
        let bus = EventBus::new(16);
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = Mutex::new(tx);
        bus.add_listener(move |event: &crate::events::Event| {
            if let EventContext::Stderr { output, .. } = &event.context {
                let _ = tx.lock().unwrap().send(output.clone());
            }
        });

        let source: &'static [u8] = b"first\nsecond\n";
        let handle = spawn_drain(1, source, Arc::clone(&buffer), bus.clone()).unwrap();
        handle.join().unwrap();

        assert_eq!(buffer.snapshot(), "first\nsecond\n");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "first\n"
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "second\n"
        );
    }

    #[test]
    fn test_drain_bounds_output_without_newlines() {
        let buffer = Arc::new(ErrBuffer::new(1024));
        let bus = EventBus::new(16);
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = Mutex::new(tx);
        bus.add_listener(move |event: &crate::events::Event| {
            if let EventContext::Stderr { output, .. } = &event.context {
                let _ = tx.lock().unwrap().send(output.len());
            }
        });

        let (reader, mut writer) = std::os::unix::net::UnixStream::pair().unwrap();
        let handle = spawn_drain(1, reader, Arc::clone(&buffer), bus.clone()).unwrap();
        std::io::Write::write_all(&mut writer, &vec![b'x'; 64 * 1024]).unwrap();

        // The writer stays open, so nothing has hit EOF yet.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while buffer.len() < 1024 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(buffer.len(), 1024);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            MAX_EVENT_OUTPUT
        );

        drop(writer);
        handle.join().unwrap();
        assert_eq!(buffer.snapshot(), "x".repeat(1024));
    }

    #[test]
    fn test_drain_flushes_partial_line_at_eof() {
        let buffer = Arc::new(ErrBuffer::default());
        let bus = EventBus::new(16);
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = Mutex::new(tx);
        bus.add_listener(move |event: &crate::events::Event| {
            if let EventContext::Stderr { output, .. } = &event.context {
                let _ = tx.lock().unwrap().send(output.clone());
            }
        });

        let source: &'static [u8] = b"done\npartial";
        spawn_drain(1, source, Arc::clone(&buffer), bus.clone())
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "done\n");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "partial");
    }
}
