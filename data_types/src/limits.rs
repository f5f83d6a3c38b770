//! Per-tenant limits and the overrides provider.

use crate::TenantId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

/// How the ingestion rate limit is accounted across distributors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IngestionRateStrategy {
    /// Each distributor enforces the full tenant limit independently.
    #[default]
    Local,
    /// Distributors divide the tenant limit by the number of live
    /// distributors, so the fleet enforces it in aggregate.
    Global,
}

/// Serde helpers accepting humantime strings ("30s", "14d") for durations.
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a duration in humantime form.
    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*d).to_string())
    }

    /// Deserialize a duration from humantime form.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// The limit set applied to one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    /// Rate limit accounting strategy.
    pub ingestion_rate_strategy: IngestionRateStrategy,
    /// Sustained ingest rate, bytes per second.
    pub ingestion_rate_limit_bytes: u64,
    /// Token bucket burst capacity, bytes.
    pub ingestion_burst_size_bytes: u64,
    /// Hard cap on the accumulated size of a single live trace.
    pub max_bytes_per_trace: u64,
    /// Hard cap on concurrently-live traces per tenant on one ingester.
    pub max_local_traces_per_user: usize,
    /// Advisory fleet-wide live trace cap (0 disables).
    pub max_global_traces_per_user: usize,
    /// How long blocks for this tenant are retained.
    #[serde(with = "duration_serde")]
    pub block_retention: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            ingestion_rate_strategy: IngestionRateStrategy::Local,
            ingestion_rate_limit_bytes: 15_000_000,
            ingestion_burst_size_bytes: 20_000_000,
            max_bytes_per_trace: 5_000_000,
            max_local_traces_per_user: 10_000,
            max_global_traces_per_user: 0,
            block_retention: Duration::from_secs(14 * 24 * 3600),
        }
    }
}

/// Provider of per-tenant [`Limits`] with workspace defaults.
///
/// Reads take the per-tenant entry if present, falling back to the
/// defaults. The map can be swapped at runtime (config reload).
#[derive(Debug, Default)]
pub struct Overrides {
    defaults: Limits,
    tenants: RwLock<HashMap<String, Limits>>,
}

impl Overrides {
    /// Create a provider with the given defaults and per-tenant entries.
    pub fn new(defaults: Limits, tenants: HashMap<String, Limits>) -> Self {
        Self {
            defaults,
            tenants: RwLock::new(tenants),
        }
    }

    /// The limits applying to `tenant`.
    pub fn for_tenant(&self, tenant: &TenantId) -> Limits {
        self.tenants
            .read()
            .get(tenant.as_str())
            .copied()
            .unwrap_or(self.defaults)
    }

    /// Replace the per-tenant entries wholesale.
    pub fn replace_tenants(&self, tenants: HashMap<String, Limits>) {
        *self.tenants.write() = tenants;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_defaults() {
        let overrides = Overrides::default();
        let tenant = TenantId::new("nobody").unwrap();
        assert_eq!(overrides.for_tenant(&tenant), Limits::default());
    }

    #[test]
    fn per_tenant_entry_wins() {
        let special = Limits {
            max_bytes_per_trace: 1,
            ..Default::default()
        };
        let overrides = Overrides::new(
            Limits::default(),
            HashMap::from([("vip".to_string(), special)]),
        );

        assert_eq!(
            overrides
                .for_tenant(&TenantId::new("vip").unwrap())
                .max_bytes_per_trace,
            1
        );
        assert_eq!(
            overrides
                .for_tenant(&TenantId::new("other").unwrap())
                .max_bytes_per_trace,
            Limits::default().max_bytes_per_trace
        );
    }

    #[test]
    fn limits_deserialize_with_humantime_durations() {
        let yaml_ish = r#"{
            "ingestion_rate_strategy": "global",
            "ingestion_rate_limit_bytes": 100,
            "block_retention": "1day"
        }"#;
        let limits: Limits = serde_json::from_str(yaml_ish).unwrap();
        assert_eq!(limits.ingestion_rate_strategy, IngestionRateStrategy::Global);
        assert_eq!(limits.ingestion_rate_limit_bytes, 100);
        assert_eq!(limits.block_retention, Duration::from_secs(24 * 3600));
        // unspecified fields fall back to defaults
        assert_eq!(
            limits.max_bytes_per_trace,
            Limits::default().max_bytes_per_trace
        );
    }
}
