use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::{
    domain::{ExecutionOutcome, ExecutionRequest, ExecutionResult},
    errors::SandboxError,
    registry::RuntimeRegistry,
    traits::sandbox::Sandbox,
};
use crate::sandbox::{
    process::{OutputReader, Termination, bytes_to_mb},
    scratch::ScratchDir,
};

const TRAILER: &str = "__codegrader__";
const COMPILE_FAILED: &str = "__codegrader_compile_failed__";
const COMPILE_FAILED_EXIT: i32 = 97;
/// `docker run` itself failed before the container started.
const DOCKER_RUN_FAILED_EXIT: i32 = 125;
const TIMEOUT_EXIT: i32 = 124;
const KILLED_EXIT: i32 = 137;
const TRAILER_SLACK: usize = 256;
const CODE_MOUNT: &str = "/code";
const BUILD_DIR: &str = "/tmp";

/// Runs every execution in a fresh, network-less container built from the
/// language's image. Limits are enforced by the container runtime; timing
/// and peak memory are reported back by a wrapper script on stderr.
#[derive(Clone, Debug)]
pub struct ContainerSandbox {
    registry: Arc<RuntimeRegistry>,
    scratch_root: PathBuf,
    binary: String,
    output_limit: usize,
    compile_timeout: Duration,
    startup_grace: Duration,
}

/// Status line printed by the wrapper script after the program exits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Trailer {
    status: i32,
    elapsed_ms: Option<u64>,
    peak_bytes: u64,
}

impl ContainerSandbox {
    pub fn new<P: AsRef<Path>>(
        registry: Arc<RuntimeRegistry>,
        scratch_root: P,
        binary: &str,
        output_limit: usize,
        compile_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            scratch_root: scratch_root.as_ref().into(),
            binary: binary.to_string(),
            output_limit,
            compile_timeout,
            startup_grace: Duration::from_secs(5),
        }
    }

    /// Whether the container runtime answers within `timeout`.
    pub async fn probe(binary: &str, timeout: Duration) -> Result<(), SandboxError> {
        let status = Command::new(binary)
            .arg("info")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(timeout, status).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(SandboxError::BackendUnavailable(format!(
                "{binary} info exited with {status}"
            ))),
            Ok(Err(err)) => Err(SandboxError::BackendUnavailable(format!("{binary}: {err}"))),
            Err(_) => Err(SandboxError::BackendUnavailable(format!(
                "{binary} info did not answer within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    fn run_args(
        &self,
        name: &str,
        scratch: &Path,
        image: &str,
        memory_limit_mb: u64,
        script: &str,
    ) -> Vec<String> {
        let memory = format!("{memory_limit_mb}m");
        let volume = format!("{}:{CODE_MOUNT}:ro", scratch.display());
        [
            "run",
            "-i",
            "--name",
            name,
            "--network",
            "none",
            "--memory",
            memory.as_str(),
            "--memory-swap",
            memory.as_str(),
            "--pids-limit",
            "64",
            "--read-only",
            "--tmpfs",
            "/tmp:rw,exec,size=64m",
            "-v",
            volume.as_str(),
            "-w",
            CODE_MOUNT,
            image,
            "sh",
            "-c",
            script,
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect()
    }

    async fn oom_killed(&self, name: &str) -> bool {
        let output = Command::new(&self.binary)
            .args(["inspect", "-f", "{{.State.OOMKilled}}", name])
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) => String::from_utf8_lossy(&output.stdout).trim() == "true",
            Err(err) => {
                tracing::warn!("Failed to inspect container {}: {}", name, err);
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl Sandbox for ContainerSandbox {
    fn name(&self) -> &'static str {
        "container"
    }

    #[tracing::instrument(skip(self, request), fields(language = %request.language_id))]
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        let descriptor = self.registry.get(&request.language_id)?;
        let scratch = ScratchDir::create(&self.scratch_root).await?;
        let file_name = descriptor.source_file_name();
        scratch.write_source(&file_name, &request.source_code).await?;

        let file = format!("{CODE_MOUNT}/{file_name}");
        let compile = descriptor.compile_command(&file, BUILD_DIR);
        let script = build_script(
            compile.as_deref(),
            &descriptor.run_command(&file, BUILD_DIR),
            request.timeout_seconds,
            self.compile_timeout.as_secs(),
            self.output_limit,
        );
        let name = format!("codegrader-{}", Uuid::new_v4());
        let args = self.run_args(
            &name,
            scratch.path(),
            &descriptor.image_ref,
            request.memory_limit_mb,
            &script,
        );

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::BackendUnavailable(format!("{}: {e}", self.binary)))?;
        let guard = ContainerGuard::new(&self.binary, &name);
        let started = Instant::now();

        if let Some(mut stdin) = child.stdin.take() {
            let input = request.input.clone();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(input.as_bytes()).await {
                    tracing::debug!("Failed to write stdin: {}", err);
                }
            });
        }
        let missing = || SandboxError::Io("container output pipe missing".to_string());
        let stdout = OutputReader::spawn(child.stdout.take().ok_or_else(missing)?, self.output_limit);
        let stderr = OutputReader::spawn(
            child.stderr.take().ok_or_else(missing)?,
            self.output_limit * 2 + TRAILER_SLACK,
        );

        let mut deadline = request.timeout() + self.startup_grace;
        if compile.is_some() {
            deadline += self.compile_timeout;
        }

        let status = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                tracing::warn!("Container {} missed the host deadline", name);
                child.start_kill()?;
                child.wait().await?;
                guard.release().await;
                return Ok(ExecutionResult {
                    stdout: stdout.finish().await,
                    stderr: String::new(),
                    exit_status: None,
                    wall_time_ms: started.elapsed().as_millis() as u64,
                    peak_memory_mb: 0.0,
                    outcome: ExecutionOutcome::TimedOut,
                });
            }
        };
        let wall_time_ms = started.elapsed().as_millis() as u64;
        let stdout = stdout.finish().await;
        let raw_stderr = stderr.finish().await;

        let Some((stderr, trailer)) = split_trailer(&raw_stderr) else {
            guard.release().await;
            return compile_failure(&raw_stderr, status.code()).ok_or_else(|| {
                let reason = raw_stderr.trim().to_string();
                if status.code() == Some(DOCKER_RUN_FAILED_EXIT) {
                    SandboxError::BackendUnavailable(reason)
                } else {
                    SandboxError::Io(format!(
                        "container exited with {status} without reporting: {reason}"
                    ))
                }
            });
        };

        let oom_killed = trailer.status == KILLED_EXIT && self.oom_killed(&name).await;
        guard.release().await;

        let elapsed_ms = trailer.elapsed_ms.unwrap_or(wall_time_ms);
        let termination = classify(trailer.status, elapsed_ms, request.timeout_seconds, oom_killed);
        let outcome = termination.outcome(stderr);
        tracing::debug!("Container {} finished in {}ms with {:?}", name, elapsed_ms, outcome);

        Ok(ExecutionResult {
            stdout,
            stderr: stderr.to_string(),
            exit_status: termination.exit_status(),
            wall_time_ms: elapsed_ms,
            peak_memory_mb: bytes_to_mb(trailer.peak_bytes),
            outcome,
        })
    }
}

/// Removes the container when the execution ends, however it ends.
#[derive(Debug)]
struct ContainerGuard {
    binary: String,
    name: String,
    released: bool,
}

impl ContainerGuard {
    fn new(binary: &str, name: &str) -> Self {
        Self {
            binary: binary.to_string(),
            name: name.to_string(),
            released: false,
        }
    }

    async fn release(mut self) {
        self.released = true;
        remove_container(&self.binary, &self.name).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Must not rely on the async runtime, which may be shutting down.
        let spawned = std::process::Command::new(&self.binary)
            .args(["rm", "-f", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!("Failed to remove container {}: {}", self.name, err);
                return;
            }
        };
        let name = self.name.clone();
        std::thread::spawn(move || match child.wait() {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::warn!("Removing container {} exited with {}", name, status),
            Err(err) => tracing::warn!("Failed to remove container {}: {}", name, err),
        });
    }
}

async fn remove_container(binary: &str, name: &str) {
    let status = Command::new(binary)
        .args(["rm", "-f", name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!("Removing container {} exited with {}", name, status),
        Err(err) => tracing::warn!("Failed to remove container {}: {}", name, err),
    }
}

/// Shell script run inside the container. Candidate stderr is buffered in
/// the tmpfs and capped so the trailer always reaches the host.
fn build_script(
    compile: Option<&str>,
    run: &str,
    timeout_seconds: u64,
    compile_timeout_seconds: u64,
    output_limit: usize,
) -> String {
    let mut script = String::new();
    if let Some(compile) = compile {
        script.push_str(&format!(
            "if ! timeout -s KILL {compile_timeout_seconds} {compile} >{BUILD_DIR}/compile.log 2>&1; then \
             echo {COMPILE_FAILED} >&2; head -c {output_limit} {BUILD_DIR}/compile.log >&2; \
             exit {COMPILE_FAILED_EXIT}; fi\n"
        ));
    }
    script.push_str("start=$(date +%s%N)\n");
    script.push_str(&format!(
        "timeout -s KILL {timeout_seconds} {run} 2>{BUILD_DIR}/stderr.log\n"
    ));
    script.push_str("status=$?\n");
    script.push_str("end=$(date +%s%N)\n");
    script.push_str(&format!("head -c {output_limit} {BUILD_DIR}/stderr.log >&2\n"));
    script.push_str(
        "peak=$(cat /sys/fs/cgroup/memory.peak 2>/dev/null \
         || cat /sys/fs/cgroup/memory/memory.max_usage_in_bytes 2>/dev/null || echo 0)\n",
    );
    script.push_str(&format!(
        "printf '\\n{TRAILER} %s %s %s\\n' \"$status\" \"$(( (end - start) / 1000000 ))\" \"$peak\" >&2\n"
    ));
    script.push_str("exit $status\n");
    script
}

/// Splits the wrapper's status line off the captured stderr.
fn split_trailer(stderr: &str) -> Option<(&str, Trailer)> {
    let marker = format!("\n{TRAILER} ");
    let at = stderr.rfind(&marker)?;
    let mut fields = stderr[at + marker.len()..].split_whitespace();

    let status = fields.next()?.parse().ok()?;
    let elapsed_ms = fields.next().and_then(|f| f.parse().ok());
    let peak_bytes = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);

    Some((
        &stderr[..at],
        Trailer {
            status,
            elapsed_ms,
            peak_bytes,
        },
    ))
}

fn compile_failure(stderr: &str, code: Option<i32>) -> Option<ExecutionResult> {
    if code != Some(COMPILE_FAILED_EXIT) {
        return None;
    }
    let log = stderr.trim_start().strip_prefix(COMPILE_FAILED)?;

    Some(ExecutionResult {
        stdout: String::new(),
        stderr: format!("Compilation error:\n{}", log.trim()),
        exit_status: code,
        wall_time_ms: 0,
        peak_memory_mb: 0.0,
        outcome: ExecutionOutcome::RuntimeError,
    })
}

/// `timeout -s KILL` exits with 137 both on expiry and when the kernel's
/// OOM killer took the program down, so elapsed time breaks the tie.
fn classify(status: i32, elapsed_ms: u64, timeout_seconds: u64, oom_killed: bool) -> Termination {
    let expired = status == TIMEOUT_EXIT
        || (status == KILLED_EXIT && elapsed_ms >= timeout_seconds * 1000);

    Termination {
        code: Some(status),
        signal: None,
        timed_out: expired,
        memory_killed: !expired && (oom_killed || status == KILLED_EXIT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_without_compile_step() {
        let script = build_script(None, "python3 -u /code/main.py", 3, 30, 1024);

        assert!(!script.contains(COMPILE_FAILED));
        assert!(script.contains("timeout -s KILL 3 python3 -u /code/main.py 2>/tmp/stderr.log"));
        assert!(script.contains("head -c 1024 /tmp/stderr.log >&2"));
        assert!(script.ends_with("exit $status\n"));
    }

    #[test]
    fn test_script_with_compile_step() {
        let script = build_script(
            Some("g++ -O2 -o /tmp/main /code/main.cpp"),
            "/tmp/main",
            2,
            30,
            4096,
        );

        let compile_at = script.find("timeout -s KILL 30 g++").unwrap();
        let run_at = script.find("timeout -s KILL 2 /tmp/main").unwrap();
        assert!(compile_at < run_at);
        assert!(script.contains(&format!("exit {COMPILE_FAILED_EXIT}")));
    }

    #[test]
    fn test_split_trailer() {
        let stderr = "warning: x\n\n__codegrader__ 0 42 10485760\n";
        let (rest, trailer) = split_trailer(stderr).unwrap();

        assert_eq!(rest, "warning: x\n");
        assert_eq!(
            trailer,
            Trailer {
                status: 0,
                elapsed_ms: Some(42),
                peak_bytes: 10 * 1024 * 1024
            }
        );

        let (rest, trailer) = split_trailer("\n__codegrader__ 1 N 0\n").unwrap();
        assert_eq!(rest, "");
        assert_eq!(trailer.status, 1);
        assert_eq!(trailer.elapsed_ms, None);

        assert_eq!(split_trailer("Unable to find image 'gcc:13' locally"), None);
    }

    #[test]
    fn test_compile_failure_report() {
        let stderr = "__codegrader_compile_failed__\nmain.cpp:1:1: error: expected ';'\n";
        let result = compile_failure(stderr, Some(COMPILE_FAILED_EXIT)).unwrap();

        assert_eq!(result.outcome, ExecutionOutcome::RuntimeError);
        assert_eq!(
            result.stderr,
            "Compilation error:\nmain.cpp:1:1: error: expected ';'"
        );
        assert_eq!(compile_failure(stderr, Some(1)), None);
    }

    #[test]
    fn test_classify_exit_statuses() {
        let completed = classify(0, 15, 2, false);
        assert_eq!(completed.outcome(""), ExecutionOutcome::Completed);
        assert_eq!(completed.exit_status(), Some(0));

        let expired = classify(KILLED_EXIT, 2001, 2, false);
        assert_eq!(expired.outcome(""), ExecutionOutcome::TimedOut);
        assert_eq!(expired.exit_status(), None);

        let oom = classify(KILLED_EXIT, 300, 2, true);
        assert_eq!(oom.outcome(""), ExecutionOutcome::MemoryExceeded);

        let failed = classify(1, 20, 2, false);
        assert_eq!(failed.outcome("IndexError"), ExecutionOutcome::RuntimeError);
        assert_eq!(failed.exit_status(), Some(1));
    }

    #[test]
    fn test_dropped_guard_removes_container_without_runtime() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("codegrader-guard-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let binary = dir.join("fake-docker");
        let record = dir.join("calls");
        std::fs::write(
            &binary,
            format!("#!/bin/sh\necho \"$@\" >> {}\n", record.display()),
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        drop(ContainerGuard::new(&binary.to_string_lossy(), "cg-abandoned"));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let calls = loop {
            let calls = std::fs::read_to_string(&record).unwrap_or_default();
            if !calls.is_empty() || std::time::Instant::now() > deadline {
                break calls;
            }
            std::thread::sleep(Duration::from_millis(20));
        };
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(calls, "rm -f cg-abandoned\n");
    }

    #[tokio::test]
    async fn test_missing_runtime_binary() {
        let sandbox = ContainerSandbox::new(
            Arc::new(RuntimeRegistry::from_descriptors(
                RuntimeRegistry::default_descriptors(),
            )),
            std::env::temp_dir().join("codegrader-container-test"),
            "definitely-not-a-container-runtime",
            1024,
            Duration::from_secs(30),
        );
        let request = ExecutionRequest {
            source_code: "print(1)".into(),
            language_id: "python".to_string(),
            input: String::new(),
            timeout_seconds: 1,
            memory_limit_mb: 64,
        };

        let err = sandbox.execute(&request).await.unwrap_err();
        assert!(matches!(err, SandboxError::BackendUnavailable(_)));

        let err = ContainerSandbox::probe("definitely-not-a-container-runtime", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::BackendUnavailable(_)));
    }
}
