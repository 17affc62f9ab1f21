//! # Broker Configuration
//!
//! Tunables for catch-up synthesis and producer behaviour.
//!
//! Values come from [`BrokerConfig::default`] and may be overridden from the
//! environment with [`BrokerConfig::from_env`]:
//!
//! - `DEBUGPORT_MODULE_SCAN_LIMIT`: loader-list entries walked during attach
//! - `DEBUGPORT_FREEZE_ON_REPORT`: `true`/`false`, suspend sibling threads while
//!   a producer waits for the debugger

use std::env;
use std::str::FromStr;

use tracing::warn;

/// Upper bound on loader-list entries examined when synthesizing module loads.
///
/// The loader list lives in target memory and may be corrupt or circular.
pub const DEFAULT_MODULE_SCAN_LIMIT: usize = 500;

/// Broker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig
{
    /// Maximum loader-list entries walked by catch-up module synthesis.
    pub module_scan_limit: usize,
    /// Suspend the reporting thread's siblings for the duration of a
    /// thread-create, thread-exit or module map/unmap round trip.
    pub freeze_on_report: bool,
}

impl Default for BrokerConfig
{
    fn default() -> Self
    {
        Self {
            module_scan_limit: DEFAULT_MODULE_SCAN_LIMIT,
            freeze_on_report: true,
        }
    }
}

impl BrokerConfig
{
    /// Build a configuration from defaults plus `DEBUGPORT_*` environment overrides.
    ///
    /// Unparseable values are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self
    {
        let mut config = Self::default();
        if let Some(limit) = env_override::<usize>("DEBUGPORT_MODULE_SCAN_LIMIT") {
            config.module_scan_limit = limit;
        }
        if let Some(freeze) = env_override::<bool>("DEBUGPORT_FREEZE_ON_REPORT") {
            config.freeze_on_report = freeze;
        }
        config
    }
}

fn env_override<T: FromStr>(key: &str) -> Option<T>
{
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable configuration override");
            None
        }
    }
}
