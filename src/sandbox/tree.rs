use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;

const MAX_KILL_ROUNDS: usize = 8;
const KILL_SETTLE: Duration = Duration::from_millis(5);

/// Every process started on behalf of one execution. Members are found by
/// walking parent links down from the leader, and by working directory for
/// processes that detached and were reparented. Dropping the tree kills
/// whatever is left of it.
#[derive(Debug)]
pub struct ProcessTree {
    leader: u32,
    leader_start: Option<u64>,
    workdir: PathBuf,
    /// pid -> start time, so a recycled pid is never mistaken for a member.
    members: HashMap<u32, u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ProcStat {
    pid: u32,
    ppid: u32,
    start_time: u64,
}

impl ProcessTree {
    pub fn new<P: AsRef<Path>>(leader: u32, workdir: P) -> Self {
        Self {
            leader,
            leader_start: read_stat(leader).map(|stat| stat.start_time),
            workdir: std::fs::canonicalize(workdir.as_ref())
                .unwrap_or_else(|_| workdir.as_ref().into()),
            members: HashMap::new(),
        }
    }

    /// Live descendants of the leader, leader excluded.
    pub fn descendants(&self) -> Vec<u32> {
        self.members
            .keys()
            .copied()
            .filter(|pid| *pid != self.leader)
            .collect()
    }

    /// Rescans `/proc`, adding new members and forgetting dead ones.
    pub fn refresh(&mut self) {
        let stats = scan_proc();
        let live: HashMap<u32, u64> = stats.iter().map(|s| (s.pid, s.start_time)).collect();
        self.members
            .retain(|pid, start| live.get(pid) == Some(start));

        let mut children: HashMap<u32, Vec<&ProcStat>> = HashMap::new();
        for stat in &stats {
            children.entry(stat.ppid).or_default().push(stat);
        }

        let mut pending: Vec<u32> = self.members.keys().copied().collect();
        if self.leader_start.is_some() && live.get(&self.leader) == self.leader_start.as_ref() {
            pending.push(self.leader);
        }
        pending.extend(
            stats
                .iter()
                .filter(|stat| self.in_workdir(stat.pid))
                .map(|stat| stat.pid),
        );

        let mut seen = HashSet::new();
        while let Some(pid) = pending.pop() {
            if !seen.insert(pid) {
                continue;
            }
            if let Some(start) = live.get(&pid) {
                self.members.insert(pid, *start);
            }
            if let Some(kids) = children.get(&pid) {
                pending.extend(kids.iter().map(|kid| kid.pid));
            }
        }
    }

    /// SIGKILLs the leader's group and every member until none is left.
    pub fn kill_all(&mut self) {
        for _ in 0..MAX_KILL_ROUNDS {
            kill_group(self.leader);
            self.refresh();
            if self.members.is_empty() {
                return;
            }
            for pid in self.members.keys() {
                match kill(Pid::from_raw(*pid as i32), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(err) => tracing::warn!("Failed to kill process {}: {}", pid, err),
                }
            }
            std::thread::sleep(KILL_SETTLE);
        }
        tracing::warn!(
            "Processes of group {} still alive: {:?}",
            self.leader,
            self.members.keys().collect::<Vec<_>>()
        );
    }

    fn in_workdir(&self, pid: u32) -> bool {
        std::fs::read_link(format!("/proc/{pid}/cwd"))
            .is_ok_and(|cwd| cwd.starts_with(&self.workdir))
    }
}

impl Drop for ProcessTree {
    fn drop(&mut self) {
        self.kill_all();
    }
}

pub fn kill_group(pid: u32) {
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => tracing::warn!("Failed to kill process group {}: {}", pid, err),
    }
}

fn scan_proc() -> Vec<ProcStat> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(read_stat)
        // Zombies are already dead and only wait to be reaped.
        .filter(|stat| stat.pid != 0)
        .collect()
}

fn read_stat(pid: u32) -> Option<ProcStat> {
    parse_stat(&std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?)
}

/// Parses `/proc/<pid>/stat`. Zombies come back with pid 0.
fn parse_stat(stat: &str) -> Option<ProcStat> {
    let (head, rest) = stat.rsplit_once(')')?;
    let pid = head.split_whitespace().next()?.parse().ok()?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let state = *fields.first()?;
    let ppid = fields.get(1)?.parse().ok()?;
    let start_time = fields.get(19)?.parse().ok()?;

    Some(ProcStat {
        pid: if matches!(state, "Z" | "X") { 0 } else { pid },
        ppid,
        start_time,
    })
}
