//! Service configuration and its synthesis from overrides.
//!
//! [`synthesize`] is pure and total: it starts from the test defaults below
//! and replaces exactly the fields present in the overrides.
//!
//! # Defaults
//!
//! | field | value |
//! |---|---|
//! | `server.threads_count` | 4 |
//! | `server.strict_contract_validation` | true |
//! | `storage.throttling_enabled` | true |
//! | ssd/hdd unit & max read/write bandwidth | 128 (MB/s) |
//! | ssd/hdd unit & max read/write iops | 65536 |
//! | `storage.inactive_clients_timeout_ms` | 10000 |
//! | `storage.zone_block_count` | 2048 |
//! | `storage.hot_zone_request_count_factor` | 2 |
//! | `storage.cold_zone_request_count_factor` | 1 |
//! | `storage.dont_enqueue_collect_garbage_upon_partition_startup` | true |
//! | `storage.optimize_for_short_ranges` | true |
//! | `storage.block_digests_enabled` | true |
//!
//! # Overlays
//!
//! Storage overlays are applied in order, each one merged onto the defaults
//! on its own: an overlay never inherits fields from the overlay before it.
//! The last overlay is the storage config the service boots with.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Throttling bandwidth ceiling in MB/s.
pub const DEFAULT_BANDWIDTH: u64 = 1 << 7;
/// Throttling IOPS ceiling.
pub const DEFAULT_IOPS: u64 = 1 << 16;
pub const DEFAULT_INACTIVE_CLIENTS_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_ZONE_BLOCK_COUNT: u32 = 2048;
pub const DEFAULT_THREADS_COUNT: u32 = 4;

// ─── ServiceConfig ───────────────────────────────────────────────────

/// Complete configuration of one service instance under test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Server-level section.
    pub server: ServerAppConfig,
    /// Base storage section.
    pub storage: StorageServiceConfig,
    /// Storage variants in application order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub storage_overlays: Vec<StorageServiceConfig>,
}

/// Server application config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerAppConfig {
    pub server: ServerConfig,
    /// Backing storage cluster subsection.
    pub backing_service: BackingServiceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server worker threads.
    pub threads_count: u32,
    /// Reject requests that violate the API contract instead of fixing them up.
    pub strict_contract_validation: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            threads_count: DEFAULT_THREADS_COUNT,
            strict_contract_validation: true,
        }
    }
}

/// Backing cluster settings. Enabled means the service talks to the
/// emulated cluster it boots itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackingServiceConfig {
    pub enabled: bool,
}

impl Default for BackingServiceConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Per-medium throttling limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaThrottling {
    pub unit_read_bandwidth: u64,
    pub unit_write_bandwidth: u64,
    pub max_read_bandwidth: u64,
    pub max_write_bandwidth: u64,
    pub unit_read_iops: u64,
    pub unit_write_iops: u64,
    pub max_read_iops: u64,
    pub max_write_iops: u64,
}

impl Default for MediaThrottling {
    fn default() -> Self {
        Self {
            unit_read_bandwidth: DEFAULT_BANDWIDTH,
            unit_write_bandwidth: DEFAULT_BANDWIDTH,
            max_read_bandwidth: DEFAULT_BANDWIDTH,
            max_write_bandwidth: DEFAULT_BANDWIDTH,
            unit_read_iops: DEFAULT_IOPS,
            unit_write_iops: DEFAULT_IOPS,
            max_read_iops: DEFAULT_IOPS,
            max_write_iops: DEFAULT_IOPS,
        }
    }
}

/// Storage service section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageServiceConfig {
    pub throttling_enabled: bool,
    /// Clients silent for longer than this are dropped.
    pub inactive_clients_timeout_ms: u64,
    pub zone_block_count: u32,
    pub hot_zone_request_count_factor: u32,
    pub cold_zone_request_count_factor: u32,
    pub dont_enqueue_collect_garbage_upon_partition_startup: bool,
    pub optimize_for_short_ranges: bool,
    /// Compute per-block digests so corruption shows up as a mismatch.
    pub block_digests_enabled: bool,
    pub ssd: MediaThrottling,
    pub hdd: MediaThrottling,
}

impl Default for StorageServiceConfig {
    fn default() -> Self {
        Self {
            throttling_enabled: true,
            ssd: MediaThrottling::default(),
            hdd: MediaThrottling::default(),
            inactive_clients_timeout_ms: DEFAULT_INACTIVE_CLIENTS_TIMEOUT_MS,
            zone_block_count: DEFAULT_ZONE_BLOCK_COUNT,
            hot_zone_request_count_factor: 2,
            cold_zone_request_count_factor: 1,
            dont_enqueue_collect_garbage_upon_partition_startup: true,
            optimize_for_short_ranges: true,
            block_digests_enabled: true,
        }
    }
}

impl ServiceConfig {
    /// Storage section the service boots with: the last overlay, or the
    /// base section when there are none.
    pub fn effective_storage(&self) -> &StorageServiceConfig {
        self.storage_overlays.last().unwrap_or(&self.storage)
    }

    /// Serialize to the TOML text form.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed {
            reason: e.to_string(),
        })
    }

    /// Parse the TOML text form. Missing fields take defaults.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })
    }

    /// Check the invariants the service itself enforces: positive limits and
    /// `unit <= max` per medium.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.server.threads_count == 0 {
            return Err(invalid("server.threads_count", "must be positive"));
        }
        self.storage.validate("storage")?;
        for (i, overlay) in self.storage_overlays.iter().enumerate() {
            overlay.validate(&format!("storage_overlays[{i}]"))?;
        }
        Ok(())
    }
}

impl StorageServiceConfig {
    /// Serialize just this section to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed {
            reason: e.to_string(),
        })
    }

    fn validate(&self, prefix: &str) -> Result<(), ConfigError> {
        self.ssd.validate(&format!("{prefix}.ssd"))?;
        self.hdd.validate(&format!("{prefix}.hdd"))?;

        let positive = [
            ("inactive_clients_timeout_ms", self.inactive_clients_timeout_ms),
            ("zone_block_count", u64::from(self.zone_block_count)),
            (
                "hot_zone_request_count_factor",
                u64::from(self.hot_zone_request_count_factor),
            ),
            (
                "cold_zone_request_count_factor",
                u64::from(self.cold_zone_request_count_factor),
            ),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(&format!("{prefix}.{field}"), "must be positive"));
            }
        }
        Ok(())
    }
}

impl MediaThrottling {
    fn validate(&self, prefix: &str) -> Result<(), ConfigError> {
        let pairs = [
            ("read_bandwidth", self.unit_read_bandwidth, self.max_read_bandwidth),
            ("write_bandwidth", self.unit_write_bandwidth, self.max_write_bandwidth),
            ("read_iops", self.unit_read_iops, self.max_read_iops),
            ("write_iops", self.unit_write_iops, self.max_write_iops),
        ];
        for (name, unit, max) in pairs {
            if unit == 0 || max == 0 {
                return Err(invalid(&format!("{prefix}.{name}"), "must be positive"));
            }
            if unit > max {
                return Err(invalid(
                    &format!("{prefix}.unit_{name}"),
                    &format!("unit value {unit} exceeds max value {max}"),
                ));
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.to_owned(),
    }
}

// ─── Overrides ───────────────────────────────────────────────────────

/// Field-level overrides for [`synthesize`]. `None` keeps the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverrides {
    pub server: ServerOverrides,
    pub storage: StorageOverrides,
    /// Storage overlays in application order.
    pub overlays: Vec<StorageOverrides>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerOverrides {
    pub threads_count: Option<u32>,
    pub strict_contract_validation: Option<bool>,
    pub backing_service_enabled: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MediaOverrides {
    pub unit_read_bandwidth: Option<u64>,
    pub unit_write_bandwidth: Option<u64>,
    pub max_read_bandwidth: Option<u64>,
    pub max_write_bandwidth: Option<u64>,
    pub unit_read_iops: Option<u64>,
    pub unit_write_iops: Option<u64>,
    pub max_read_iops: Option<u64>,
    pub max_write_iops: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageOverrides {
    pub throttling_enabled: Option<bool>,
    pub ssd: MediaOverrides,
    pub hdd: MediaOverrides,
    pub inactive_clients_timeout_ms: Option<u64>,
    pub zone_block_count: Option<u32>,
    pub hot_zone_request_count_factor: Option<u32>,
    pub cold_zone_request_count_factor: Option<u32>,
    pub dont_enqueue_collect_garbage_upon_partition_startup: Option<bool>,
    pub optimize_for_short_ranges: Option<bool>,
    pub block_digests_enabled: Option<bool>,
}

impl StorageOverrides {
    /// Parse an overlay passed as a JSON parameter. An absent parameter
    /// yields `None`.
    pub fn from_json(param: Option<&str>) -> Result<Option<Self>, ConfigError> {
        let Some(text) = param else {
            return Ok(None);
        };
        serde_json::from_str(text)
            .map(Some)
            .map_err(|e| ConfigError::ParseFailed {
                reason: format!("storage override: {e}"),
            })
    }

    /// Overlay applying every throttling, zone and feature value explicitly.
    ///
    /// Bandwidth 128 MB/s and 65536 IOPS for both media, inactive-client
    /// timeout 10s, 2048-block zones, digests on.
    pub fn default_patch() -> Self {
        let media = MediaOverrides {
            unit_read_bandwidth: Some(DEFAULT_BANDWIDTH),
            unit_write_bandwidth: Some(DEFAULT_BANDWIDTH),
            max_read_bandwidth: Some(DEFAULT_BANDWIDTH),
            max_write_bandwidth: Some(DEFAULT_BANDWIDTH),
            unit_read_iops: Some(DEFAULT_IOPS),
            unit_write_iops: Some(DEFAULT_IOPS),
            max_read_iops: Some(DEFAULT_IOPS),
            max_write_iops: Some(DEFAULT_IOPS),
        };
        Self {
            throttling_enabled: Some(true),
            ssd: media,
            hdd: media,
            inactive_clients_timeout_ms: Some(DEFAULT_INACTIVE_CLIENTS_TIMEOUT_MS),
            zone_block_count: Some(DEFAULT_ZONE_BLOCK_COUNT),
            hot_zone_request_count_factor: Some(2),
            cold_zone_request_count_factor: Some(1),
            dont_enqueue_collect_garbage_upon_partition_startup: Some(true),
            optimize_for_short_ranges: Some(true),
            block_digests_enabled: Some(true),
        }
    }

    /// Defaults with this overlay applied.
    pub fn resolve(&self) -> StorageServiceConfig {
        let mut storage = StorageServiceConfig::default();
        self.apply_to(&mut storage);
        storage
    }

    fn apply_to(&self, storage: &mut StorageServiceConfig) {
        set(&mut storage.throttling_enabled, self.throttling_enabled);
        self.ssd.apply_to(&mut storage.ssd);
        self.hdd.apply_to(&mut storage.hdd);
        set(
            &mut storage.inactive_clients_timeout_ms,
            self.inactive_clients_timeout_ms,
        );
        set(&mut storage.zone_block_count, self.zone_block_count);
        set(
            &mut storage.hot_zone_request_count_factor,
            self.hot_zone_request_count_factor,
        );
        set(
            &mut storage.cold_zone_request_count_factor,
            self.cold_zone_request_count_factor,
        );
        set(
            &mut storage.dont_enqueue_collect_garbage_upon_partition_startup,
            self.dont_enqueue_collect_garbage_upon_partition_startup,
        );
        set(
            &mut storage.optimize_for_short_ranges,
            self.optimize_for_short_ranges,
        );
        set(&mut storage.block_digests_enabled, self.block_digests_enabled);
    }
}

impl MediaOverrides {
    fn apply_to(&self, media: &mut MediaThrottling) {
        set(&mut media.unit_read_bandwidth, self.unit_read_bandwidth);
        set(&mut media.unit_write_bandwidth, self.unit_write_bandwidth);
        set(&mut media.max_read_bandwidth, self.max_read_bandwidth);
        set(&mut media.max_write_bandwidth, self.max_write_bandwidth);
        set(&mut media.unit_read_iops, self.unit_read_iops);
        set(&mut media.unit_write_iops, self.unit_write_iops);
        set(&mut media.max_read_iops, self.max_read_iops);
        set(&mut media.max_write_iops, self.max_write_iops);
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

// ─── synthesize ──────────────────────────────────────────────────────

/// Build a service config from the test defaults and `overrides`.
///
/// Never fails and performs no I/O.
pub fn synthesize(overrides: &ConfigOverrides) -> ServiceConfig {
    let mut config = ServiceConfig::default();

    let server = &overrides.server;
    set(&mut config.server.server.threads_count, server.threads_count);
    set(
        &mut config.server.server.strict_contract_validation,
        server.strict_contract_validation,
    );
    set(
        &mut config.server.backing_service.enabled,
        server.backing_service_enabled,
    );

    overrides.storage.apply_to(&mut config.storage);
    config.storage_overlays = overrides
        .overlays
        .iter()
        .map(StorageOverrides::resolve)
        .collect();

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_overrides_yield_documented_defaults() {
        let config = synthesize(&ConfigOverrides::default());

        assert_eq!(config.server.server.threads_count, 4);
        assert!(config.server.server.strict_contract_validation);
        assert!(config.server.backing_service.enabled);

        let storage = &config.storage;
        assert!(storage.throttling_enabled);
        for media in [&storage.ssd, &storage.hdd] {
            assert_eq!(media.unit_read_bandwidth, 128);
            assert_eq!(media.unit_write_bandwidth, 128);
            assert_eq!(media.max_read_bandwidth, 128);
            assert_eq!(media.max_write_bandwidth, 128);
            assert_eq!(media.unit_read_iops, 65536);
            assert_eq!(media.unit_write_iops, 65536);
            assert_eq!(media.max_read_iops, 65536);
            assert_eq!(media.max_write_iops, 65536);
        }
        assert_eq!(storage.inactive_clients_timeout_ms, 10_000);
        assert_eq!(storage.zone_block_count, 2048);
        assert_eq!(storage.hot_zone_request_count_factor, 2);
        assert_eq!(storage.cold_zone_request_count_factor, 1);
        assert!(storage.dont_enqueue_collect_garbage_upon_partition_startup);
        assert!(storage.optimize_for_short_ranges);
        assert!(storage.block_digests_enabled);
        assert!(config.storage_overlays.is_empty());
    }

    #[test]
    fn present_fields_replace_and_absent_fields_keep_defaults() {
        let overrides = ConfigOverrides {
            server: ServerOverrides {
                threads_count: Some(12),
                strict_contract_validation: Some(false),
                ..Default::default()
            },
            storage: StorageOverrides {
                ssd: MediaOverrides {
                    max_write_iops: Some(1000),
                    ..Default::default()
                },
                zone_block_count: Some(64),
                block_digests_enabled: Some(false),
                ..Default::default()
            },
            overlays: vec![],
        };

        let config = synthesize(&overrides);
        let defaults = StorageServiceConfig::default();

        assert_eq!(config.server.server.threads_count, 12);
        assert!(!config.server.server.strict_contract_validation);
        assert!(config.server.backing_service.enabled);

        assert_eq!(config.storage.ssd.max_write_iops, 1000);
        assert_eq!(config.storage.zone_block_count, 64);
        assert!(!config.storage.block_digests_enabled);

        // every other field is untouched
        let mut expected = defaults.clone();
        expected.ssd.max_write_iops = 1000;
        expected.zone_block_count = 64;
        expected.block_digests_enabled = false;
        assert_eq!(config.storage, expected);
        assert_eq!(config.storage.hdd, defaults.hdd);
    }

    #[test]
    fn default_patch_resolves_to_defaults() {
        assert_eq!(
            StorageOverrides::default_patch().resolve(),
            StorageServiceConfig::default()
        );
    }

    // Overlays are sequential full replacement: the second overlay does not
    // inherit the first overlay's zone size.
    #[test]
    fn overlays_apply_in_order_as_full_replacement() {
        let first = StorageOverrides {
            zone_block_count: Some(512),
            ..Default::default()
        };
        let second = StorageOverrides {
            inactive_clients_timeout_ms: Some(2_000),
            ..Default::default()
        };
        let config = synthesize(&ConfigOverrides {
            overlays: vec![first, second],
            ..Default::default()
        });

        assert_eq!(config.storage_overlays.len(), 2);
        assert_eq!(config.storage_overlays[0].zone_block_count, 512);
        assert_eq!(config.storage_overlays[1].zone_block_count, 2048);
        assert_eq!(config.storage_overlays[1].inactive_clients_timeout_ms, 2_000);
        assert_eq!(config.effective_storage(), &config.storage_overlays[1]);
    }

    #[test]
    fn effective_storage_falls_back_to_base() {
        let config = synthesize(&ConfigOverrides::default());
        assert_eq!(config.effective_storage(), &config.storage);
    }

    #[test]
    fn from_json_absent_param_is_none() {
        assert_eq!(StorageOverrides::from_json(None).unwrap(), None);
    }

    #[test]
    fn from_json_parses_nested_fields() {
        let parsed = StorageOverrides::from_json(Some(
            r#"{"ssd": {"max_read_iops": 100}, "throttling_enabled": false}"#,
        ))
        .unwrap()
        .unwrap();
        assert_eq!(parsed.ssd.max_read_iops, Some(100));
        assert_eq!(parsed.throttling_enabled, Some(false));
        assert_eq!(parsed.hdd, MediaOverrides::default());
    }

    #[test]
    fn from_json_rejects_unknown_fields() {
        let err = StorageOverrides::from_json(Some(r#"{"zone_blocks": 1}"#)).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed { .. }));
    }

    #[test]
    fn toml_text_form_roundtrips() {
        let config = synthesize(&ConfigOverrides {
            overlays: vec![StorageOverrides::default_patch()],
            ..Default::default()
        });
        let text = config.to_toml().unwrap();
        assert!(text.contains("zone_block_count = 2048"));
        let parsed = ServiceConfig::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn validate_accepts_defaults() {
        synthesize(&ConfigOverrides::default()).validate().unwrap();
    }

    #[test]
    fn validate_rejects_unit_above_max() {
        let mut config = ServiceConfig::default();
        config.storage.hdd.unit_write_bandwidth = 256;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("storage.hdd.unit_write_bandwidth"));
    }

    #[test]
    fn validate_rejects_zero_limits_in_overlays() {
        let mut config = ServiceConfig::default();
        let mut overlay = StorageServiceConfig::default();
        overlay.zone_block_count = 0;
        config.storage_overlays.push(overlay);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("storage_overlays[0].zone_block_count"));
    }

    #[test]
    fn validate_rejects_zero_threads() {
        let mut config = ServiceConfig::default();
        config.server.server.threads_count = 0;
        assert!(config.validate().is_err());
    }
}
