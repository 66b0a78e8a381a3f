use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sched::{CloneFlags, unshare};
use nix::sys::resource::{Resource, setrlimit};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::core::{
    domain::{ExecutionOutcome, ExecutionRequest, ExecutionResult},
    errors::SandboxError,
    registry::RuntimeRegistry,
    traits::sandbox::Sandbox,
};
use crate::sandbox::{
    process::{OutputReader, Termination},
    scratch::ScratchDir,
    tree::ProcessTree,
};

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);
const TREE_SCAN_INTERVAL: Duration = Duration::from_millis(50);
const MAX_OPEN_FILES: u64 = 256;

/// Runs candidate code as a direct child process. Limits are applied
/// between fork and exec; the child leads its own process group so the
/// whole tree can be killed at once.
#[derive(Clone, Debug)]
pub struct LocalProcessSandbox {
    registry: Arc<RuntimeRegistry>,
    scratch_root: PathBuf,
    output_limit: usize,
    compile_timeout: Duration,
    isolate_network: bool,
}

#[derive(Clone, Copy, Debug)]
struct ChildLimits {
    address_space_bytes: Option<u64>,
    cpu_seconds: u64,
    isolate_network: bool,
}

#[derive(Debug)]
struct Supervised {
    termination: Termination,
    stdout: String,
    stderr: String,
    wall_time: Duration,
    peak_memory_kb: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct MemoryUsage {
    peak_kb: u64,
    rss_kb: u64,
}

impl LocalProcessSandbox {
    pub fn new<P: AsRef<Path>>(
        registry: Arc<RuntimeRegistry>,
        scratch_root: P,
        output_limit: usize,
        compile_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            scratch_root: scratch_root.as_ref().into(),
            output_limit,
            compile_timeout,
            isolate_network: false,
        }
    }

    pub fn with_network_isolation(mut self, enabled: bool) -> Self {
        self.isolate_network = enabled;
        self
    }

    /// Whether children can be placed in fresh user and network namespaces
    /// on this host.
    pub async fn probe_network_isolation() -> bool {
        let limits = ChildLimits {
            address_space_bytes: None,
            cpu_seconds: 1,
            isolate_network: true,
        };
        let mut cmd = Command::new("true");
        cmd.env_clear()
            .env("PATH", SANDBOX_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: only raw syscalls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || apply_child_limits(&limits));
        }

        match cmd.status().await {
            Ok(status) => status.success(),
            Err(err) => {
                tracing::debug!("Network namespace probe failed: {}", err);
                false
            }
        }
    }

    fn command(
        &self,
        command_line: &str,
        workdir: &Path,
        limits: ChildLimits,
    ) -> Result<Command, SandboxError> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| SandboxError::Spawn("empty command template".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(parts)
            .current_dir(workdir)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        // SAFETY: only raw syscalls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || apply_child_limits(&limits));
        }
        Ok(cmd)
    }

    async fn supervise(
        &self,
        mut cmd: Command,
        workdir: &Path,
        input: &str,
        timeout: Duration,
        memory_limit_bytes: Option<u64>,
    ) -> Result<Supervised, SandboxError> {
        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::Spawn("child has no pid".to_string()))?;
        // Dropped before `child`, so a cancelled run takes its whole tree down.
        let mut tree = ProcessTree::new(pid, workdir);
        let started = Instant::now();

        if let Some(mut stdin) = child.stdin.take() {
            let input = input.to_string();
            tokio::spawn(async move {
                // The program may exit without reading its input.
                if let Err(err) = stdin.write_all(input.as_bytes()).await {
                    tracing::debug!("Failed to write stdin: {}", err);
                }
            });
        }
        let stdout = spawn_reader(&mut child, true, self.output_limit)?;
        let stderr = spawn_reader(&mut child, false, self.output_limit)?;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut sampler = tokio::time::interval(MEMORY_SAMPLE_INTERVAL);
        let mut rescan = tokio::time::interval(TREE_SCAN_INTERVAL);
        let mut peak_memory_kb = 0u64;

        let termination = loop {
            tokio::select! {
                status = child.wait() => break Termination::from_status(status?),
                _ = &mut deadline => {
                    tree.kill_all();
                    let status = child.wait().await?;
                    break Termination {
                        timed_out: true,
                        ..Termination::from_status(status)
                    };
                }
                _ = rescan.tick() => tree.refresh(),
                _ = sampler.tick() => {
                    let Some(usage) = sample_memory(pid, &tree.descendants()) else {
                        continue;
                    };
                    peak_memory_kb = peak_memory_kb.max(usage.peak_kb);
                    if memory_limit_bytes.is_some_and(|limit| usage.rss_kb * 1024 > limit) {
                        tree.kill_all();
                        let status = child.wait().await?;
                        break Termination {
                            memory_killed: true,
                            ..Termination::from_status(status)
                        };
                    }
                }
            }
        };
        let wall_time = started.elapsed();
        // Background and detached descendants would otherwise hold the pipes open.
        tree.kill_all();

        Ok(Supervised {
            termination,
            stdout: stdout.finish().await,
            stderr: stderr.finish().await,
            wall_time,
            peak_memory_kb,
        })
    }
}

#[async_trait::async_trait]
impl Sandbox for LocalProcessSandbox {
    fn name(&self) -> &'static str {
        "local"
    }

    #[tracing::instrument(skip(self, request), fields(language = %request.language_id))]
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        let descriptor = self.registry.get(&request.language_id)?;
        let scratch = ScratchDir::create(&self.scratch_root).await?;
        let source_path = scratch
            .write_source(&descriptor.source_file_name(), &request.source_code)
            .await?;
        let file = source_path.to_string_lossy();
        let dir = scratch.path().to_string_lossy();

        if let Some(compile_line) = descriptor.compile_command(&file, &dir) {
            let limits = ChildLimits {
                address_space_bytes: None,
                cpu_seconds: self.compile_timeout.as_secs().max(1),
                isolate_network: self.isolate_network,
            };
            let cmd = self.command(&compile_line, scratch.path(), limits)?;
            let compiled = self
                .supervise(cmd, scratch.path(), "", self.compile_timeout, None)
                .await?;
            if compiled.termination.outcome(&compiled.stderr) != ExecutionOutcome::Completed {
                tracing::debug!("Compilation failed: {:?}", compiled.termination);
                return Ok(compile_failure(&compiled, self.compile_timeout));
            }
        }

        let limits = ChildLimits {
            address_space_bytes: Some(request.memory_limit_bytes()),
            cpu_seconds: request.timeout_seconds.max(1),
            isolate_network: self.isolate_network,
        };
        let cmd = self.command(&descriptor.run_command(&file, &dir), scratch.path(), limits)?;
        let run = self
            .supervise(
                cmd,
                scratch.path(),
                &request.input,
                request.timeout(),
                Some(request.memory_limit_bytes()),
            )
            .await?;

        let outcome = run.termination.outcome(&run.stderr);
        tracing::debug!(
            "Finished in {:?} with {:?}, peak {} kB",
            run.wall_time,
            outcome,
            run.peak_memory_kb
        );

        Ok(ExecutionResult {
            exit_status: run.termination.exit_status(),
            wall_time_ms: run.wall_time.as_millis() as u64,
            peak_memory_mb: run.peak_memory_kb as f64 / 1024.0,
            outcome,
            stdout: run.stdout,
            stderr: run.stderr,
        })
    }
}

fn apply_child_limits(limits: &ChildLimits) -> std::io::Result<()> {
    if limits.isolate_network {
        unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)?;
    }
    if let Some(bytes) = limits.address_space_bytes {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    setrlimit(
        Resource::RLIMIT_CPU,
        limits.cpu_seconds,
        limits.cpu_seconds + 1,
    )?;
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    setrlimit(Resource::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES)?;
    Ok(())
}

fn compile_failure(compiled: &Supervised, compile_timeout: Duration) -> ExecutionResult {
    let details = if compiled.termination.timed_out {
        format!("compiler exceeded {}s", compile_timeout.as_secs())
    } else {
        compiled.stderr.trim_end().to_string()
    };

    ExecutionResult {
        stdout: String::new(),
        stderr: format!("Compilation error:\n{details}"),
        exit_status: compiled.termination.exit_status(),
        wall_time_ms: compiled.wall_time.as_millis() as u64,
        peak_memory_mb: 0.0,
        outcome: ExecutionOutcome::RuntimeError,
    }
}

fn spawn_reader(child: &mut Child, stdout: bool, limit: usize) -> Result<OutputReader, SandboxError> {
    let missing = || SandboxError::Io("child output pipe missing".to_string());
    Ok(if stdout {
        OutputReader::spawn(child.stdout.take().ok_or_else(missing)?, limit)
    } else {
        OutputReader::spawn(child.stderr.take().ok_or_else(missing)?, limit)
    })
}

/// Peak of the leader and resident memory summed over the whole tree.
fn sample_memory(leader: u32, descendants: &[u32]) -> Option<MemoryUsage> {
    // Between fork and exec the child is still a copy of this process.
    let exe = std::fs::read_link(format!("/proc/{leader}/exe")).ok()?;
    if std::fs::read_link("/proc/self/exe").ok()? == exe {
        return None;
    }
    let leader_usage = read_memory(leader)?;
    let rss_kb = leader_usage.rss_kb
        + descendants
            .iter()
            .filter_map(|pid| read_memory(*pid))
            .map(|usage| usage.rss_kb)
            .sum::<u64>();

    Some(MemoryUsage {
        peak_kb: leader_usage.peak_kb.max(rss_kb),
        rss_kb,
    })
}

fn read_memory(pid: u32) -> Option<MemoryUsage> {
    parse_proc_status(&std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?)
}

fn parse_proc_status(status: &str) -> Option<MemoryUsage> {
    let field = |name: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
    };

    Some(MemoryUsage {
        peak_kb: field("VmHWM:")?,
        rss_kb: field("VmRSS:").unwrap_or(0),
    })
}
