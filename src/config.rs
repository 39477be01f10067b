use std::time::Duration;

use crate::error::ConfigError;

/// Upper bound on concurrent endpoints.
pub const MAX_WORKERS: usize = 5_000;

/// How the external TLS probe tool is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeToolConfig {
    pub program: String,
    /// NSE script that enumerates protocol versions and ciphers.
    pub script: String,
    /// Extra arguments placed before the target address.
    pub extra_args: Vec<String>,
}

impl Default for ProbeToolConfig {
    fn default() -> Self {
        Self {
            program: "nmap".to_string(),
            script: "ssl-enum-ciphers".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// How the local listening-socket tool is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl Default for ListerConfig {
    fn default() -> Self {
        Self {
            program: "lsof".to_string(),
            args: vec![
                "-nP".to_string(),
                "-iTCP".to_string(),
                "-sTCP:LISTEN".to_string(),
            ],
            timeout: Duration::from_secs(10),
        }
    }
}

/// Settings for one scan run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Max endpoints processed at once (each runs its own subprocesses).
    pub workers: usize,
    /// Per-probe deadline.
    pub probe_timeout: Duration,
    /// Whole-run deadline; when it fires the run is cancelled.
    pub run_deadline: Option<Duration>,
    /// Cap on scheduled endpoints, applied in discovery order.
    pub limit_ips: Option<usize>,
    /// Cap on captured bytes per subprocess stream.
    pub max_output_bytes: usize,
    pub probe: ProbeToolConfig,
    pub lister: ListerConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            probe_timeout: Duration::from_secs(90),
            run_deadline: None,
            limit_ips: None,
            max_output_bytes: 8 * 1024 * 1024,
            probe: ProbeToolConfig::default(),
            lister: ListerConfig::default(),
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.workers > MAX_WORKERS {
            return Err(ConfigError::TooManyWorkers {
                got: self.workers,
                max: MAX_WORKERS,
            });
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout { what: "probe" });
        }
        if self.lister.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout { what: "lister" });
        }
        if matches!(self.run_deadline, Some(d) if d.is_zero()) {
            return Err(ConfigError::ZeroTimeout { what: "run" });
        }
        if self.limit_ips == Some(0) {
            return Err(ConfigError::ZeroLimit);
        }
        if self.probe.program.trim().is_empty() {
            return Err(ConfigError::EmptyProgram { what: "probe" });
        }
        if self.lister.program.trim().is_empty() {
            return Err(ConfigError::EmptyProgram { what: "lister" });
        }
        Ok(())
    }
}
