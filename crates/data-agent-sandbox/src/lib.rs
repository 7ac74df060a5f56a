#![forbid(unsafe_code)]

use std::any::Any;
use std::fs;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use data_agent_domain::{
    AgentError, CancelToken, ErrorKind, ResourceQuota, SandboxResult, ToolError,
};
use serde::Serialize;
use tracing::{debug, warn};

// USER_HZ, the unit of utime/stime in /proc/<pid>/stat. Linux reports it as
// 100 on every architecture regardless of the kernel tick rate.
const CLOCK_TICKS_PER_SECOND: f64 = 100.0;
const KB_PER_MB: f64 = 1024.0;

/// How long a cancelled worker gets to wind down before it is left detached.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Source of process resource readings.
pub trait ResourceProbe: Send + Sync {
    /// Resident memory in megabytes, or 0 when unavailable.
    fn memory_mb(&self) -> f64;

    /// Total CPU time consumed by the process so far.
    fn cpu_time(&self) -> Option<Duration>;
}

/// Reads `/proc/self`. Reports nothing on platforms without procfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcfsProbe;

impl ResourceProbe for ProcfsProbe {
    fn memory_mb(&self) -> f64 {
        fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| vm_rss_mb(&status))
            .unwrap_or(0.0)
    }

    fn cpu_time(&self) -> Option<Duration> {
        let stat = fs::read_to_string("/proc/self/stat").ok()?;
        // Fields after the parenthesised command name start at `state`.
        let rest = stat.rsplit_once(')')?.1;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let utime = fields.get(11)?.parse::<f64>().ok()?;
        let stime = fields.get(12)?.parse::<f64>().ok()?;
        Duration::try_from_secs_f64((utime + stime) / CLOCK_TICKS_PER_SECOND).ok()
    }
}

// `VmRSS:   12345 kB` from /proc/<pid>/status.
fn vm_rss_mb(status: &str) -> Option<f64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let mut fields = line.split_whitespace().skip(1);
    let value = fields.next()?.parse::<f64>().ok()?;
    match fields.next() {
        Some("kB") | None => Some(value / KB_PER_MB),
        Some(_) => None,
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct ResourceSnapshot {
    pub memory_mb: f64,
    pub cpu_seconds: f64,
}

/// Runs a single invocation under a wall-clock deadline and samples memory
/// and CPU around it.
#[derive(Clone)]
pub struct Sandbox {
    probe: Arc<dyn ResourceProbe>,
    cancel_grace: Duration,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("cancel_grace", &self.cancel_grace)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    #[must_use]
    pub fn new() -> Self {
        Self::with_probe(Arc::new(ProcfsProbe))
    }

    #[must_use]
    pub fn with_probe(probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            probe,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    #[must_use]
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    #[must_use]
    pub fn monitor_resources(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            memory_mb: self.probe.memory_mb(),
            cpu_seconds: self.probe.cpu_time().map_or(0.0, |cpu| cpu.as_secs_f64()),
        }
    }

    /// Execute `func` on a worker thread and wait at most
    /// `quota.max_execution_seconds` for it.
    ///
    /// On timeout the worker's [`CancelToken`] is cancelled and the worker
    /// gets the cancel grace period to return. A worker still running after
    /// that is detached and the result is marked `worker_outstanding`; its
    /// eventual result is discarded. Memory and CPU overruns are recorded as
    /// violations without failing an otherwise successful run.
    pub fn execute_in_sandbox<T, F>(&self, func: F, quota: &ResourceQuota) -> SandboxResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> Result<T, ToolError> + Send + 'static,
    {
        let started = Instant::now();
        let memory_before = self.probe.memory_mb();
        let cpu_before = self.probe.cpu_time();

        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("data-agent-sandbox".to_string())
            .spawn(move || {
                let _ = tx.send(func(&worker_cancel));
            });
        let worker = match worker {
            Ok(handle) => handle,
            Err(err) => {
                return failed(
                    format!("Execution error: failed to start sandbox worker: {err}"),
                    ErrorKind::NonRecoverable,
                    started,
                );
            }
        };

        let deadline = Duration::try_from_secs_f64(quota.max_execution_seconds)
            .ok()
            .filter(|limit| !limit.is_zero());
        let received = match deadline {
            Some(limit) => rx.recv_timeout(limit),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        let mut violations = Vec::new();
        let mut worker_outstanding = false;
        let (success, result, error, error_kind) = match received {
            Ok(Ok(value)) => (true, Some(value), None, None),
            Ok(Err(err)) => {
                let kind = err.kind();
                (false, None, Some(err.message), Some(kind))
            }
            Err(RecvTimeoutError::Timeout) => {
                let seconds = quota.max_execution_seconds;
                warn!(seconds, "sandbox deadline exceeded");
                cancel.cancel();
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(self.cancel_grace) {
                    warn!(
                        grace_ms = self.cancel_grace.as_millis(),
                        "sandbox worker ignored cancellation, detaching it"
                    );
                    worker_outstanding = true;
                } else {
                    let _ = worker.join();
                }
                violations.push(format!("Timeout exceeded: {seconds}s"));
                let message = AgentError::SandboxTimeout { seconds }.to_string();
                (false, None, Some(message), Some(ErrorKind::Timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let (message, kind) = match worker.join() {
                    Err(payload) => describe_panic(payload.as_ref()),
                    Ok(()) => (
                        "Execution error: sandbox worker exited without a result".to_string(),
                        ErrorKind::NonRecoverable,
                    ),
                };
                (false, None, Some(message), Some(kind))
            }
        };

        let elapsed = started.elapsed();
        let memory_after = self.probe.memory_mb();
        let memory_delta = (memory_after - memory_before).max(0.0);
        let peak_memory_mb = memory_before.max(memory_after);
        #[allow(clippy::cast_precision_loss)]
        let memory_limit = quota.max_memory_mb as f64;
        if memory_delta > memory_limit {
            violations.push(format!(
                "Memory usage exceeded limit: {memory_delta:.1}MB > {}MB",
                quota.max_memory_mb
            ));
        }

        let avg_cpu_percent = match (cpu_before, self.probe.cpu_time()) {
            (Some(before), Some(after)) if !elapsed.is_zero() => {
                after.saturating_sub(before).as_secs_f64() / elapsed.as_secs_f64() * 100.0
            }
            _ => 0.0,
        };
        if avg_cpu_percent > quota.max_cpu_percent {
            violations.push(format!(
                "CPU usage exceeded limit: {avg_cpu_percent:.1}% > {}%",
                quota.max_cpu_percent
            ));
        }

        debug!(
            success,
            elapsed_ms = elapsed.as_millis(),
            violations = violations.len(),
            "sandbox execution finished"
        );

        SandboxResult {
            success,
            result,
            error,
            error_kind,
            execution_time_seconds: elapsed.as_secs_f64(),
            peak_memory_mb,
            avg_cpu_percent,
            violations,
            worker_outstanding,
        }
    }
}

fn failed<T>(message: String, kind: ErrorKind, started: Instant) -> SandboxResult<T> {
    SandboxResult {
        success: false,
        result: None,
        error: Some(message),
        error_kind: Some(kind),
        execution_time_seconds: started.elapsed().as_secs_f64(),
        peak_memory_mb: 0.0,
        avg_cpu_percent: 0.0,
        violations: Vec::new(),
        worker_outstanding: false,
    }
}

fn describe_panic(payload: &(dyn Any + Send)) -> (String, ErrorKind) {
    let text = payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    let lower = text.to_lowercase();
    if lower.contains("memory") || lower.contains("capacity overflow") {
        (
            AgentError::SandboxResourceExceeded(format!("Memory exhausted: {text}")).to_string(),
            ErrorKind::ResourceExceeded,
        )
    } else {
        (
            format!("Execution error: worker panicked: {text}"),
            ErrorKind::NonRecoverable,
        )
    }
}
