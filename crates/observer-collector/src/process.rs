use crate::Collector;
use anyhow::{anyhow, Result};
use observer_common::types::Metric;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Resource usage of the agent process itself.
pub struct ProcessCollector {
    system: System,
    pid: Option<Pid>,
}

impl ProcessCollector {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            tracing::warn!("Current process id unavailable, process metrics disabled");
        }
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for ProcessCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for ProcessCollector {
    fn name(&self) -> &str {
        "process"
    }

    fn collect(&mut self) -> Result<Vec<Metric>> {
        let pid = self
            .pid
            .ok_or_else(|| anyhow!("process id not available on this platform"))?;
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = self
            .system
            .process(pid)
            .ok_or_else(|| anyhow!("process {pid} not found"))?;

        let disk = process.disk_usage();
        Ok(vec![
            Metric::gauge("ProcessResidentMemory", process.memory() as f64),
            Metric::gauge("ProcessVirtualMemory", process.virtual_memory() as f64),
            Metric::gauge("ProcessCpuUsage", f64::from(process.cpu_usage())),
            Metric::gauge("ProcessDiskRead", disk.total_read_bytes as f64),
            Metric::gauge("ProcessDiskWritten", disk.total_written_bytes as f64),
            Metric::gauge("ProcessUptime", process.run_time() as f64),
        ])
    }
}
