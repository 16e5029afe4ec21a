//! Health snapshot of a dependency that bulk work is gated on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster health as reported by a search/index backend.
///
/// Ordered so that `Red < Yellow < Green`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterHealth {
    Red,
    Yellow,
    Green,
}

impl fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Red => "red",
            Self::Yellow => "yellow",
            Self::Green => "green",
        };
        f.write_str(name)
    }
}

/// Point-in-time health of a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: ClusterHealth,
    pub processor_percent: f64,
    pub memory_percent: f64,
}

impl HealthSnapshot {
    /// Create a snapshot with the given status and resource usage.
    pub fn new(status: ClusterHealth, processor_percent: f64, memory_percent: f64) -> Self {
        Self {
            status,
            processor_percent,
            memory_percent,
        }
    }

    /// A green snapshot with idle resources.
    pub fn green() -> Self {
        Self::new(ClusterHealth::Green, 0.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_health_ordering() {
        assert!(ClusterHealth::Red < ClusterHealth::Yellow);
        assert!(ClusterHealth::Yellow < ClusterHealth::Green);
        assert!(ClusterHealth::Green >= ClusterHealth::Yellow);
    }
}
