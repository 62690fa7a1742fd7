//! Command handlers -- one module per subcommand

pub mod config;
pub mod local;
pub mod validate;

use bsh_core::service_config::{ConfigOverrides, StorageOverrides};
use bsh_core::types::thread_count;

use crate::cli::OverrideArgs;
use crate::error::CliError;

impl OverrideArgs {
    /// Parse the JSON parameters into service config overrides.
    ///
    /// Without `--storage-override` the default test patch applies. The
    /// thread count is always pinned, from `--threads` or the host.
    pub fn to_overrides(&self) -> Result<ConfigOverrides, CliError> {
        let parse = |param: &str| -> Result<StorageOverrides, CliError> {
            StorageOverrides::from_json(Some(param))
                .map_err(|e| CliError::Config(e.to_string()))?
                .ok_or_else(|| CliError::Config("empty storage override".to_owned()))
        };

        let storage = match self.storage_override.as_deref() {
            Some(param) => parse(param)?,
            None => StorageOverrides::default_patch(),
        };
        let overlays = self
            .storage_overlays
            .iter()
            .map(|param| parse(param))
            .collect::<Result<Vec<_>, _>>()?;

        let mut overrides = ConfigOverrides {
            storage,
            overlays,
            ..ConfigOverrides::default()
        };
        overrides.server.threads_count = Some(match self.threads {
            Some(0) => return Err(CliError::Config("--threads must be greater than 0".to_owned())),
            Some(n) => n,
            None => thread_count(),
        });
        Ok(overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flags_apply_default_patch_and_pin_threads() {
        let overrides = OverrideArgs::default().to_overrides().unwrap();
        assert_eq!(overrides.storage, StorageOverrides::default_patch());
        assert!(overrides.overlays.is_empty());
        assert!(overrides.server.threads_count.unwrap_or(0) > 0);
    }

    #[test]
    fn explicit_override_replaces_default_patch() {
        let args = OverrideArgs {
            storage_override: Some(r#"{"throttling_enabled": false}"#.to_owned()),
            storage_overlays: vec![r#"{"zone_block_count": 512}"#.to_owned()],
            threads: Some(2),
        };
        let overrides = args.to_overrides().unwrap();
        assert_eq!(overrides.storage.throttling_enabled, Some(false));
        assert_eq!(overrides.storage.zone_block_count, None);
        assert_eq!(overrides.overlays[0].zone_block_count, Some(512));
        assert_eq!(overrides.server.threads_count, Some(2));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let args = OverrideArgs {
            storage_override: Some("{throttling".to_owned()),
            ..OverrideArgs::default()
        };
        let err = args.to_overrides().unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn zero_threads_rejected() {
        let args = OverrideArgs {
            threads: Some(0),
            ..OverrideArgs::default()
        };
        assert!(matches!(args.to_overrides(), Err(CliError::Config(_))));
    }
}
