use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

/// Drains a pipe on a background thread, keeping at most `cap` bytes.
///
/// Output beyond the cap is still read and discarded, so a chatty program
/// never blocks on a full pipe.
pub struct CaptureHandle {
    buffer: Arc<Mutex<Captured>>,
    done: mpsc::Receiver<()>,
}

impl CaptureHandle {
    pub fn spawn<R>(name: &str, reader: R, cap: usize) -> std::io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Captured::default()));
        let (tx, done) = mpsc::channel();
        let shared = buffer.clone();

        thread::Builder::new()
            .name(format!("capture-{name}"))
            .spawn(move || {
                if let Err(e) = read_capped(reader, cap, &shared) {
                    log::debug!("Capture stopped early: {e}");
                }
                let _ = tx.send(());
            })?;

        Ok(Self { buffer, done })
    }

    /// Waits up to `grace` for the writer side to close, then returns
    /// whatever was captured so far.
    pub fn finish(self, grace: Duration) -> Captured {
        if self.done.recv_timeout(grace).is_err() {
            // Someone outside the process group still holds the pipe
            log::warn!("Output pipe still open after {grace:?}, returning partial capture");
        }
        std::mem::take(&mut *self.buffer.lock())
    }
}

fn read_capped<R: Read>(mut reader: R, cap: usize, out: &Mutex<Captured>) -> std::io::Result<()> {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        let mut captured = out.lock();
        let room = cap.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        let keep = n.min(room);
        if keep > 0 {
            captured.bytes.extend_from_slice(&chunk[..keep]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    const GRACE: Duration = Duration::from_secs(5);

    #[test]
    fn test_short_output_is_kept_whole() {
        let handle = CaptureHandle::spawn("test", Cursor::new(b"hello".to_vec()), 16).unwrap();
        assert_eq!(
            handle.finish(GRACE),
            Captured {
                bytes: b"hello".to_vec(),
                truncated: false
            }
        );
    }

    #[test]
    fn test_output_at_exact_cap_is_not_truncated() {
        let handle = CaptureHandle::spawn("test", Cursor::new(vec![b'x'; 16]), 16).unwrap();
        let captured = handle.finish(GRACE);
        assert_eq!(captured.bytes.len(), 16);
        assert!(!captured.truncated);
    }

    #[test]
    fn test_long_output_is_cut_at_cap() {
        let data = vec![b'y'; 3 * READ_CHUNK + 17];
        let handle = CaptureHandle::spawn("test", Cursor::new(data), 1000).unwrap();
        let captured = handle.finish(GRACE);
        assert_eq!(captured.bytes.len(), 1000);
        assert!(captured.truncated);
    }

    #[test]
    fn test_partial_capture_when_writer_never_closes() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "printf partial; exec sleep 5"])
            .stdout(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();

        let handle = CaptureHandle::spawn("test", stdout, 64).unwrap();
        thread::sleep(Duration::from_millis(200));
        let captured = handle.finish(Duration::from_millis(50));
        assert_eq!(captured.bytes, b"partial".to_vec());

        child.kill().unwrap();
        child.wait().unwrap();
    }
}
