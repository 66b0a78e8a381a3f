use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use crate::core::domain::ExecutionOutcome;

/// Stderr fragments runtimes print when an allocation fails under a limit.
const MEMORY_MARKERS: [&str; 5] = [
    "MemoryError",
    "std::bad_alloc",
    "Cannot allocate memory",
    "out of memory",
    "Out of memory",
];

const OUTPUT_GRACE: Duration = Duration::from_secs(1);

/// A child's output stream drained by a background task. Bytes read so far
/// stay available even when the stream never reaches EOF.
#[derive(Debug)]
pub struct OutputReader {
    kept: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl OutputReader {
    /// Keeps at most `limit` bytes. The rest is drained and dropped so the
    /// writer never blocks on a full pipe.
    pub fn spawn<R>(reader: R, limit: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let kept = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(read_capped(reader, limit, kept.clone()));
        Self { kept, task }
    }

    /// Waits briefly for EOF, then returns whatever was captured.
    pub async fn finish(mut self) -> String {
        match tokio::time::timeout(OUTPUT_GRACE, &mut self.task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => tracing::warn!("Failed to read child output: {}", err),
            Ok(Err(err)) => tracing::warn!("Output reader panicked: {}", err),
            Err(_) => {
                tracing::warn!("Output pipe still open after the process ended");
                self.task.abort();
            }
        }
        let kept = self.kept.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&kept).into_owned()
    }
}

async fn read_capped<R>(mut reader: R, limit: usize, kept: Arc<Mutex<Vec<u8>>>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut dropped = 0usize;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let mut kept = kept.lock().unwrap_or_else(PoisonError::into_inner);
        let room = limit.saturating_sub(kept.len());
        kept.extend_from_slice(&buf[..n.min(room)]);
        dropped += n.saturating_sub(room);
    }

    if dropped > 0 {
        tracing::debug!("Output truncated, {} bytes dropped", dropped);
    }
    Ok(())
}

/// How a sandboxed process ended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Termination {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Killed by the sandbox at the wall-clock deadline.
    pub timed_out: bool,
    /// Killed by the sandbox for exceeding the memory limit.
    pub memory_killed: bool,
}

impl Termination {
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
            ..Self::default()
        }
    }

    pub fn exit_status(&self) -> Option<i32> {
        if self.timed_out || self.memory_killed {
            return None;
        }
        self.code.or(self.signal.map(|signal| 128 + signal))
    }

    pub fn outcome(&self, stderr: &str) -> ExecutionOutcome {
        if self.timed_out || self.signal == Some(Signal::SIGXCPU as i32) {
            ExecutionOutcome::TimedOut
        } else if self.memory_killed {
            ExecutionOutcome::MemoryExceeded
        } else if self.code == Some(0) {
            ExecutionOutcome::Completed
        } else if MEMORY_MARKERS.iter().any(|marker| stderr.contains(marker)) {
            ExecutionOutcome::MemoryExceeded
        } else {
            ExecutionOutcome::RuntimeError
        }
    }
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn test_output_is_truncated_and_drained() {
        let data = std::io::Cursor::new(vec![b'x'; 20_000]);
        assert_eq!(OutputReader::spawn(data, 10).finish().await, "xxxxxxxxxx");

        let text = OutputReader::spawn(&b"hello\n"[..], 1024).finish().await;
        assert_eq!(text, "hello\n");
    }

    #[tokio::test]
    async fn test_open_pipe_keeps_captured_output() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let output = OutputReader::spawn(reader, 1024);
        writer.write_all(b"answer\n").await.unwrap();

        let started = std::time::Instant::now();
        let text = output.finish().await;

        assert_eq!(text, "answer\n");
        assert!(started.elapsed() < Duration::from_secs(3));
        drop(writer);
    }

    #[test]
    fn test_outcome_classification() {
        let exited = |code| Termination {
            code: Some(code),
            ..Termination::default()
        };

        assert_eq!(exited(0).outcome(""), ExecutionOutcome::Completed);
        assert_eq!(exited(0).exit_status(), Some(0));
        assert_eq!(exited(1).outcome("ValueError"), ExecutionOutcome::RuntimeError);
        assert_eq!(
            exited(1).outcome("Traceback ...\nMemoryError\n"),
            ExecutionOutcome::MemoryExceeded
        );
        assert_eq!(
            exited(134).outcome("terminate called after throwing an instance of 'std::bad_alloc'"),
            ExecutionOutcome::MemoryExceeded
        );
    }

    #[test]
    fn test_signals_and_sandbox_kills() {
        let segfault = Termination {
            signal: Some(Signal::SIGSEGV as i32),
            ..Termination::default()
        };
        assert_eq!(segfault.outcome(""), ExecutionOutcome::RuntimeError);
        assert_eq!(segfault.exit_status(), Some(139));

        let cpu_limit = Termination {
            signal: Some(Signal::SIGXCPU as i32),
            ..Termination::default()
        };
        assert_eq!(cpu_limit.outcome(""), ExecutionOutcome::TimedOut);

        let timed_out = Termination {
            signal: Some(Signal::SIGKILL as i32),
            timed_out: true,
            ..Termination::default()
        };
        assert_eq!(timed_out.outcome(""), ExecutionOutcome::TimedOut);
        assert_eq!(timed_out.exit_status(), None);

        let memory = Termination {
            signal: Some(Signal::SIGKILL as i32),
            memory_killed: true,
            ..Termination::default()
        };
        assert_eq!(memory.outcome(""), ExecutionOutcome::MemoryExceeded);
    }
}
