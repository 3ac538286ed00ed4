//! Round-trip latency measurement shared by tunnels and mesh health checks.
//!
//! The system `ping` is tried first and its reported time is parsed; when ping
//! is unavailable or fails the probe falls back to timing a TCP connect.

use regex::Regex;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

/// Default probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

static PING_TIME: LazyLock<Regex> = LazyLock::new(|| {
    // `time=12.3 ms` (unix), `time=12ms` / `time<1ms` (windows)
    Regex::new(r"time[=<]\s*([\d.]+)\s*ms").expect("ping time pattern is valid")
});

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe of {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    #[error("probe of {target} failed: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ping {target} failed: {reason}")]
    Command { target: String, reason: String },
}

/// Stateless latency probe.
#[derive(Debug, Clone, Copy)]
pub struct LatencyProbe {
    timeout: Duration,
    use_ping: bool,
}

impl Default for LatencyProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl LatencyProbe {
    pub fn new(timeout: Duration) -> Self {
        LatencyProbe {
            timeout,
            use_ping: true,
        }
    }

    /// Probe that only times TCP connects.
    pub fn tcp_only(timeout: Duration) -> Self {
        LatencyProbe {
            timeout,
            use_ping: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Measures latency to `host`, using `port` for the connect fallback.
    pub async fn measure(&self, host: &str, port: u16) -> Result<Duration, ProbeError> {
        if self.use_ping {
            match self.ping(host).await {
                Ok(rtt) => return Ok(rtt),
                Err(e) => debug!(host, error = %e, "ping failed, falling back to TCP connect"),
            }
        }
        self.connect_rtt(host, port).await
    }

    /// One ICMP echo via the system `ping` command.
    pub async fn ping(&self, host: &str) -> Result<Duration, ProbeError> {
        // ping would read it as an option
        if host.starts_with('-') {
            return Err(ProbeError::Command {
                target: host.to_string(),
                reason: "host name may not start with '-'".to_string(),
            });
        }
        let mut command = Command::new("ping");
        if cfg!(windows) {
            command.args(["-n", "1", "-w", &self.timeout.as_millis().to_string(), host]);
        } else {
            let secs = self.timeout.as_secs().max(1).to_string();
            command.args(["-c", "1", "-W", &secs, host]);
        }
        command.kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout + Duration::from_secs(1), command.output())
            .await
            .map_err(|_| ProbeError::Timeout {
                target: host.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|e| ProbeError::Command {
                target: host.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ProbeError::Command {
                target: host.to_string(),
                reason: format!("exit status {}", output.status),
            });
        }

        parse_ping_output(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            ProbeError::Command {
                target: host.to_string(),
                reason: "no round-trip time in output".to_string(),
            }
        })
    }

    /// Time taken to complete a TCP handshake with `host:port`.
    pub async fn connect_rtt(&self, host: &str, port: u16) -> Result<Duration, ProbeError> {
        let target = format!("{host}:{port}");
        let start = Instant::now();

        match tokio::time::timeout(self.timeout, TcpStream::connect(target.as_str())).await {
            Ok(Ok(_stream)) => Ok(start.elapsed()),
            Ok(Err(source)) => Err(ProbeError::Io { target, source }),
            Err(_) => Err(ProbeError::Timeout {
                target,
                timeout: self.timeout,
            }),
        }
    }
}

/// Extracts the round-trip time from `ping` output.
pub fn parse_ping_output(output: &str) -> Option<Duration> {
    let captures = PING_TIME.captures(output)?;
    let millis: f64 = captures.get(1)?.as_str().parse().ok()?;
    if !millis.is_finite() || millis < 0.0 {
        return None;
    }
    Some(Duration::from_micros((millis * 1000.0).round() as u64))
}
