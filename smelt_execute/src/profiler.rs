use std::time::Duration;

use smelt_events::CommandEventVariant;
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};
use tokio::sync::mpsc::UnboundedSender;

/// One RSS + CPU-load reading for a process subtree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSample {
    pub memory_used_bytes: u64,
    pub cpu_load: f32,
    /// Set when the raw `cpu_load` reading was non-finite and got coerced to 0.
    pub coerced: bool,
}

/// Sums memory and CPU usage across `root` and every process whose parent chain leads back to
/// it. `sysinfo` normalizes `cpu_usage()` to a percentage of one core since the last refresh, so
/// a subtree pegging two cores reports ~200.0 -- callers treat that as the wire value directly,
/// same as the single-process case.
pub fn sample_subtree(system: &System, root: u32) -> Option<ProcessSample> {
    let root_pid = Pid::from_u32(root);
    system.process(root_pid)?;

    let mut memory_used_bytes = 0u64;
    let mut cpu_load = 0f32;
    let mut found_root = false;

    for (pid, process) in system.processes() {
        if *pid == root_pid || is_descendant_of(system, *pid, root_pid) {
            if *pid == root_pid {
                found_root = true;
            }
            memory_used_bytes += process.memory();
            cpu_load += process.cpu_usage();
        }
    }

    if !found_root {
        return None;
    }

    let (cpu_load, coerced) = coerce_finite(cpu_load);
    Some(ProcessSample {
        memory_used_bytes,
        cpu_load,
        coerced,
    })
}

fn is_descendant_of(system: &System, pid: Pid, ancestor: Pid) -> bool {
    let mut current = pid;
    while let Some(process) = system.process(current) {
        match process.parent() {
            Some(parent) if parent == ancestor => return true,
            Some(parent) if parent != current => current = parent,
            _ => return false,
        }
    }
    false
}

fn coerce_finite(value: f32) -> (f32, bool) {
    if value.is_finite() {
        (value, false)
    } else {
        tracing::warn!(value, "non-finite cpu load sample, coercing to 0");
        (0.0, true)
    }
}

/// Periodically samples a process subtree's RSS and CPU load and emits them as
/// `CommandEventVariant::Profile` events. The first sample is always skipped: `sysinfo` needs one
/// prior refresh to compute a CPU delta, so a first-sample reading would be meaningless noise.
pub struct Profiler {
    pid: u32,
    period: Duration,
}

impl Profiler {
    pub fn new(pid: u32, period: Duration) -> Self {
        Profiler { pid, period }
    }

    pub async fn run(self, tx: UnboundedSender<CommandEventVariant>) {
        let mut system = System::new();
        let mut skipped_first = false;

        loop {
            tokio::time::sleep(self.period).await;
            system.refresh_processes();

            if !skipped_first {
                skipped_first = true;
                continue;
            }

            match sample_subtree(&system, self.pid) {
                Some(sample) => {
                    if sample.coerced {
                        let _ = tx.send(CommandEventVariant::Warn(format!(
                            "non-finite cpu load sample for pid {}, coerced to 0",
                            self.pid
                        )));
                    }
                    let _ = tx.send(CommandEventVariant::Profile {
                        memory_used_bytes: sample.memory_used_bytes,
                        cpu_load: sample.cpu_load,
                    });
                }
                None => return, // process is gone; nothing left to sample
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_finite_replaces_nan_and_infinity_with_zero() {
        assert_eq!(coerce_finite(f32::NAN), (0.0, true));
        assert_eq!(coerce_finite(f32::INFINITY), (0.0, true));
        assert_eq!(coerce_finite(3.5), (3.5, false));
    }

    #[test]
    fn sample_subtree_returns_none_for_an_unknown_pid() {
        let system = System::new();
        assert!(sample_subtree(&system, u32::MAX).is_none());
    }
}
