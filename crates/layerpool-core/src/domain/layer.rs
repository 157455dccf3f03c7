//! The closed set of processing layers and their static capacity shares.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DispatchError;

/// A named processing layer. Every layer owns exactly one worker pool.
///
/// The set is closed: layers cannot be added at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Core,
    Realtime,
    Neural,
    Analytics,
    Security,
    Communication,
    Storage,
    Integration,
    Optimization,
    Monitoring,
    Backup,
    Lightning,
}

impl Layer {
    /// All layers in pool creation order.
    pub const ALL: [Layer; 12] = [
        Layer::Core,
        Layer::Realtime,
        Layer::Neural,
        Layer::Analytics,
        Layer::Security,
        Layer::Communication,
        Layer::Storage,
        Layer::Integration,
        Layer::Optimization,
        Layer::Monitoring,
        Layer::Backup,
        Layer::Lightning,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Layer::Core => "core",
            Layer::Realtime => "realtime",
            Layer::Neural => "neural",
            Layer::Analytics => "analytics",
            Layer::Security => "security",
            Layer::Communication => "communication",
            Layer::Storage => "storage",
            Layer::Integration => "integration",
            Layer::Optimization => "optimization",
            Layer::Monitoring => "monitoring",
            Layer::Backup => "backup",
            Layer::Lightning => "lightning",
        }
    }

    /// Share of the total CPU count allotted to this layer, in permille.
    pub fn cpu_share_permille(self) -> usize {
        match self {
            Layer::Core => 300,
            Layer::Realtime => 200,
            Layer::Neural => 250,
            Layer::Analytics => 150,
            Layer::Security => 100,
            Layer::Communication => 100,
            Layer::Storage => 100,
            Layer::Integration => 100,
            Layer::Optimization => 150,
            Layer::Monitoring => 100,
            Layer::Backup => 100,
            Layer::Lightning => 200,
        }
    }

    /// Startup worker count: `max(1, floor(cpu_count * share))`.
    pub fn initial_worker_count(self, cpu_count: usize) -> usize {
        (cpu_count.saturating_mul(self.cpu_share_permille()) / 1000).max(1)
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Layer::ALL
            .into_iter()
            .find(|layer| layer.as_str() == s)
            .ok_or_else(|| DispatchError::InvalidLayer(s.to_string()))
    }
}
