//! # Worker Thread Spawning
//!
//! Spawns the pipeline's long-lived worker threads (collector input/output
//! loops, receiver read loops, sender drain loops) with a name and, where the
//! deployment asks for it, a real-time scheduling class and CPU pin.
//!
//! Telescope data keeps arriving whether or not the software is scheduled, so
//! production deployments run the hot loops under SCHED_FIFO on dedicated
//! cores. Elevated scheduling requires privileges; every setting here
//! degrades to a `tracing::warn!` rather than failing the spawn, because a
//! best-effort pipeline beats no pipeline.
//!
//! ## Example
//!
//! ```rust
//! use tabx_core::rt::{WorkerConfig, WorkerPriority, spawn_worker};
//!
//! let config = WorkerConfig::new("input-loop").priority(WorkerPriority::High);
//! let handle = spawn_worker(config, || 21 * 2).unwrap();
//! assert_eq!(handle.join().unwrap(), 42);
//! ```

use std::io;
use std::thread::{self, JoinHandle};

/// Scheduling class for a worker thread.
///
/// Maps to SCHED_FIFO priorities on Linux; other platforms run everything as
/// `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPriority {
    /// Default scheduler, no real-time class.
    Normal,
    /// SCHED_FIFO 50: drain loops that must keep up but may yield.
    Medium,
    /// SCHED_FIFO 80: hot receive/assemble loops.
    High,
}

impl Default for WorkerPriority {
    fn default() -> Self {
        WorkerPriority::Normal
    }
}

impl WorkerPriority {
    fn is_realtime(self) -> bool {
        self != WorkerPriority::Normal
    }

    #[cfg(target_os = "linux")]
    fn to_fifo_priority(self) -> i32 {
        match self {
            WorkerPriority::Normal => 0,
            WorkerPriority::Medium => 50,
            WorkerPriority::High => 80,
        }
    }
}

/// Configuration for one worker thread.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub name: String,
    pub priority: WorkerPriority,
    /// Cores to pin to; empty means no affinity.
    pub cpu_affinity: Vec<usize>,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: WorkerPriority::Normal,
            cpu_affinity: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: WorkerPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn cpu_affinity(mut self, cpus: &[usize]) -> Self {
        self.cpu_affinity = cpus.to_vec();
        self
    }
}

/// Spawn a named worker thread, applying scheduling settings inside it.
pub fn spawn_worker<F, T>(config: WorkerConfig, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let WorkerConfig {
        name,
        priority,
        cpu_affinity,
    } = config;
    thread::Builder::new().name(name).spawn(move || {
        if priority.is_realtime() {
            if let Err(e) = set_fifo_priority(priority) {
                tracing::warn!("could not enter real-time class: {}", e);
            }
        }
        if !cpu_affinity.is_empty() {
            if let Err(e) = set_cpu_affinity(&cpu_affinity) {
                tracing::warn!("could not pin worker to {:?}: {}", cpu_affinity, e);
            }
        }
        f()
    })
}

#[cfg(target_os = "linux")]
fn set_fifo_priority(priority: WorkerPriority) -> io::Result<()> {
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = priority.to_fifo_priority();
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_fifo_priority(_priority: WorkerPriority) -> io::Result<()> {
    tracing::debug!("real-time scheduling not supported on this platform");
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(cpus: &[usize]) -> io::Result<()> {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            if cpu < libc::CPU_SETSIZE as usize {
                libc::CPU_SET(cpu, &mut set);
            }
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(_cpus: &[usize]) -> io::Result<()> {
    tracing::debug!("CPU affinity not supported on this platform");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_normal_worker() {
        let handle = spawn_worker(WorkerConfig::new("test-worker"), || 7).unwrap();
        assert_eq!(handle.join().unwrap(), 7);
    }

    #[test]
    fn test_worker_gets_name() {
        let handle = spawn_worker(WorkerConfig::new("named-loop"), || {
            thread::current().name().map(str::to_string)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("named-loop"));
    }

    #[test]
    fn test_priority_classes() {
        assert!(!WorkerPriority::Normal.is_realtime());
        assert!(WorkerPriority::Medium.is_realtime());
        assert!(WorkerPriority::High.is_realtime());
    }
}
