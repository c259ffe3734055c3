//! Runtime configuration
//!
//! ```toml
//! abi = "sysv"                  # or "win64"; host ABI when omitted
//! page_size = 16384             # trampoline pool size; OS page size when omitted
//! isolate_id = 1                # loaded into the isolate register by trampolines
//! log_missing_registrations = true
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::abi::Abi;
use crate::error::{ForeignError, ForeignResult};
use crate::memory::{allocation_granularity, os_page_size};

/// Configuration for a `ForeignRuntime`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForeignConfig {
    /// Calling convention (default: host)
    pub abi: Option<Abi>,
    /// Bytes per trampoline pool (default: OS page size)
    pub page_size: Option<usize>,
    /// Isolate identity handed to upcall stubs (default: 0)
    pub isolate_id: u64,
    /// Warn once per descriptor when a stub lookup fails (default: true)
    pub log_missing_registrations: bool,
}

impl Default for ForeignConfig {
    fn default() -> Self {
        ForeignConfig {
            abi: None,
            page_size: None,
            isolate_id: 0,
            log_missing_registrations: true,
        }
    }
}

impl ForeignConfig {
    /// Parse a configuration file
    pub fn from_file(path: &Path) -> ForeignResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ForeignError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> ForeignResult<Self> {
        let config: ForeignConfig = toml::from_str(content).map_err(|e| ForeignError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The configured ABI, or the host's
    pub fn resolve_abi(&self) -> ForeignResult<Abi> {
        match self.abi {
            Some(abi) => Ok(abi),
            None => Abi::host(),
        }
    }

    /// The configured pool size, or the OS page size
    pub fn resolve_page_size(&self) -> usize {
        self.page_size.unwrap_or_else(os_page_size)
    }

    pub fn validate(&self) -> ForeignResult<()> {
        if let Some(page_size) = self.page_size {
            if !page_size.is_power_of_two() {
                return Err(ForeignError::Config(format!(
                    "page_size must be a power of two, got {}",
                    page_size
                )));
            }
            let os_page = os_page_size();
            if page_size < os_page {
                return Err(ForeignError::Config(format!(
                    "page_size {} is smaller than the OS page size {}",
                    page_size, os_page
                )));
            }
            let granularity = allocation_granularity();
            if page_size > granularity {
                return Err(ForeignError::Config(format!(
                    "page_size {} exceeds the allocation granularity {}",
                    page_size, granularity
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ForeignConfig::default();
        assert_eq!(config.abi, None);
        assert!(config.log_missing_registrations);
        assert_eq!(config.resolve_page_size(), os_page_size());
    }

    #[test]
    fn test_parse_full_config() {
        let config = ForeignConfig::from_toml_str(
            r#"
            abi = "win64"
            page_size = 65536
            isolate_id = 3
            log_missing_registrations = false
            "#,
        )
        .unwrap();
        assert_eq!(config.abi, Some(Abi::Win64));
        assert_eq!(config.page_size, Some(65536));
        assert_eq!(config.isolate_id, 3);
        assert!(!config.log_missing_registrations);
        assert_eq!(config.resolve_abi().unwrap(), Abi::Win64);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = ForeignConfig::from_toml_str("abi = \"sysv\"").unwrap();
        assert_eq!(config.abi, Some(Abi::SysV));
        assert_eq!(config.isolate_id, 0);
        assert!(config.log_missing_registrations);
    }

    #[test]
    fn test_rejects_bad_page_size() {
        let err = ForeignConfig::from_toml_str("page_size = 5000").unwrap_err();
        assert!(matches!(err, ForeignError::Config(_)));
        let err = ForeignConfig::from_toml_str("page_size = 512").unwrap_err();
        assert!(err.to_string().contains("smaller than the OS page size"));
    }

    #[cfg(unix)]
    #[test]
    fn test_accepts_pool_larger_than_os_page() {
        let page_size = os_page_size() * 4;
        let config = ForeignConfig::from_toml_str(&format!("page_size = {}", page_size)).unwrap();
        assert_eq!(config.resolve_page_size(), page_size);
    }

    #[test]
    fn test_rejects_unknown_abi_and_keys() {
        assert!(ForeignConfig::from_toml_str("abi = \"aapcs\"").is_err());
        assert!(ForeignConfig::from_toml_str("trampolines = 4").is_err());
    }
}
