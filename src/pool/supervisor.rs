//! Per-pool recycling limits, applied to a worker after each successful job.

use std::fmt;
use std::time::Duration;

use crate::config::PoolConfig;
use crate::worker::Worker;

/// Why a healthy worker is being replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecycleReason {
    MaxJobs(u64),
    MaxTtl(Duration),
    MaxMemory { rss_mib: u64, limit_mib: u64 },
}

impl fmt::Display for RecycleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxJobs(n) => write!(f, "reached {} jobs", n),
            Self::MaxTtl(ttl) => write!(f, "exceeded TTL of {:?}", ttl),
            Self::MaxMemory { rss_mib, limit_mib } => {
                write!(f, "using {} MiB (limit {} MiB)", rss_mib, limit_mib)
            }
        }
    }
}

/// Limits that trigger proactive recycling. Zero disables a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecyclePolicy {
    pub max_jobs: u64,
    pub max_ttl: Option<Duration>,
    pub max_memory_mib: u64,
}

impl From<&PoolConfig> for RecyclePolicy {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_jobs: config.max_jobs,
            max_ttl: config.max_ttl(),
            max_memory_mib: config.max_memory,
        }
    }
}

impl RecyclePolicy {
    pub fn is_enabled(&self) -> bool {
        self.max_jobs > 0 || self.max_ttl.is_some() || self.max_memory_mib > 0
    }

    /// First limit the worker has hit, if any.
    pub fn check(&self, worker: &Worker) -> Option<RecycleReason> {
        self.evaluate(worker.jobs(), worker.age(), || {
            read_process_rss_mib(worker.pid())
        })
    }

    fn evaluate(
        &self,
        jobs: u64,
        age: Duration,
        rss_mib: impl FnOnce() -> Option<u64>,
    ) -> Option<RecycleReason> {
        if self.max_jobs > 0 && jobs >= self.max_jobs {
            return Some(RecycleReason::MaxJobs(self.max_jobs));
        }
        if let Some(ttl) = self.max_ttl
            && age >= ttl
        {
            return Some(RecycleReason::MaxTtl(ttl));
        }
        if self.max_memory_mib > 0
            && let Some(rss) = rss_mib()
            && rss > self.max_memory_mib
        {
            return Some(RecycleReason::MaxMemory {
                rss_mib: rss,
                limit_mib: self.max_memory_mib,
            });
        }
        None
    }
}

/// Resident set size of a process in MiB.
///
/// Reads the second field of `/proc/<pid>/statm`, in pages (assumed 4KB).
#[cfg(target_os = "linux")]
pub fn read_process_rss_mib(pid: u32) -> Option<u64> {
    let contents = std::fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    let resident_pages: u64 = contents.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4 / 1024)
}

#[cfg(not(target_os = "linux"))]
pub fn read_process_rss_mib(_pid: u32) -> Option<u64> {
    None
}
