//! Tunnel selection policies.

use std::fmt;
use std::time::Duration;

/// Rule used by auto-select to pick one tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionMethod {
    /// Lowest measured latency; failed probes are excluded.
    #[default]
    Latency,
    /// Any startable tunnel.
    Random,
    /// Least loaded; degrades to latency while no load signal exists.
    LeastLoad,
}

impl SelectionMethod {
    /// Parses a configured name. Unknown names select by latency.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "random" => SelectionMethod::Random,
            "load" | "least-load" | "least_load" => SelectionMethod::LeastLoad,
            "latency" => SelectionMethod::Latency,
            other => {
                tracing::warn!(method = other, "Unknown selection method, using latency");
                SelectionMethod::Latency
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionMethod::Latency => "latency",
            SelectionMethod::Random => "random",
            SelectionMethod::LeastLoad => "load",
        }
    }
}

impl fmt::Display for SelectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Picks the entry with the lowest latency. `None` marks a failed probe and is
/// never chosen. Ties go to the earliest entry.
pub fn lowest_latency<'a, S: AsRef<str>>(measured: &'a [(S, Option<Duration>)]) -> Option<&'a str> {
    let mut best: Option<(&'a str, Duration)> = None;
    for (name, latency) in measured {
        let Some(latency) = *latency else { continue };
        if best.is_none_or(|(_, current)| latency < current) {
            best = Some((name.as_ref(), latency));
        }
    }
    best.map(|(name, _)| name)
}
