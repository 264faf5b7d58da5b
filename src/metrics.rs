//! Global request counters and the diagnostic renditions built from them.
//!
//! All counters are atomics updated with relaxed ordering: they feed
//! monitoring output, not control flow.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use sysinfo::{Pid, System};

/// Process-wide counters owned by the `Server` and shared with the reactor
/// and workers.
#[derive(Debug, Default)]
pub struct Metrics {
    requests_total: AtomicU64,
    total_time_ns: AtomicU64,
    active_threads: AtomicUsize,
    connections: AtomicUsize,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished request and its wall-clock duration.
    pub fn record_request(&self, elapsed: Duration) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.total_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn enter_handler(&self) {
        self.active_threads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn leave_handler(&self) {
        self.active_threads.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn active_threads(&self) -> usize {
        self.active_threads.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Total processing time in seconds.
    pub fn total_time_seconds(&self) -> f64 {
        self.total_time_ns.load(Ordering::Relaxed) as f64 / 1e9
    }

    /// Mean request duration in seconds; zero before the first request.
    pub fn avg_time_seconds(&self) -> f64 {
        let total = self.requests_total();
        if total == 0 {
            0.0
        } else {
            self.total_time_seconds() / total as f64
        }
    }
}

/// Host identity and memory figures for `/api/sysinfo`.
pub struct SystemProbe {
    total_ram: u64,
    pid: Pid,
    sys: Mutex<System>,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        Self {
            total_ram: sys.total_memory(),
            pid: Pid::from_u32(std::process::id()),
            sys: Mutex::new(sys),
        }
    }

    pub fn total_ram(&self) -> u64 {
        self.total_ram
    }

    /// Resident set size of this process in bytes.
    pub fn memory_usage(&self) -> u64 {
        let mut sys = match self.sys.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sys.refresh_process(self.pid);
        sys.process(self.pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// The process's host name ("pod" in the diagnostic outputs).
pub fn pod_name() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Prometheus text exposition for `/api/metrics`.
pub fn render_prometheus(metrics: &Metrics, pod: &str, pool_size: usize) -> String {
    let mut body = String::with_capacity(512);
    let gauge = |body: &mut String, name: &str, help: &str, value: String| {
        body.push_str(&format!(
            "# HELP {name} {help}.\n# TYPE {name} gauge\n{name}{{pod=\"{pod}\"}} {value}\n"
        ));
    };
    gauge(
        &mut body,
        "cpp_requests_total",
        "The number of HTTP requests processed",
        metrics.requests_total().to_string(),
    );
    gauge(
        &mut body,
        "cpp_connections_current",
        "Current client tcp-ip connections",
        metrics.connections().to_string(),
    );
    gauge(
        &mut body,
        "cpp_active_threads_current",
        "Current active threads",
        metrics.active_threads().to_string(),
    );
    gauge(
        &mut body,
        "cpp_pool_size",
        "Thread pool size",
        pool_size.to_string(),
    );
    gauge(
        &mut body,
        "cpp_request_duration_avg_seconds",
        "Average request processing time in seconds",
        format!("{:.6}", metrics.avg_time_seconds()),
    );
    body
}

/// JSON envelope for `/api/sysinfo`.
pub fn render_sysinfo(
    metrics: &Metrics,
    probe: &SystemProbe,
    pod: &str,
    start_date: &str,
    pool_size: usize,
) -> String {
    format!(
        r#"{{"status":"OK","data":[{{"pod":"{}","startDate":"{}","totalRequests":{},"avgTimePerRequest":{:.6},"connections":{},"activeThreads":{},"poolSize":{},"totalRam":{},"memoryUsage":{}}}]}}"#,
        pod,
        start_date,
        metrics.requests_total(),
        metrics.avg_time_seconds(),
        metrics.connections(),
        metrics.active_threads(),
        pool_size,
        probe.total_ram(),
        probe.memory_usage(),
    )
}
