//! Allocator configuration
//!
//! Defaults reproduce the classic block-pool behaviour. Every knob can be set
//! programmatically through the builder methods or from the environment:
//!
//! - `ROCVMM_FIT_POLICY`: `strict` (default) or `exact`
//! - `ROCVMM_MIN_BLOCK_SIZE`: bytes, with optional `K`/`M`/`G` suffix (default 0)
//! - `ROCVMM_REUSE_ADDRESSES`: `true`/`false` (default true)
//! - `ROCVMM_STRICT_RELEASE`: `true`/`false` (default true)

use std::fmt;
use std::str::FromStr;

use crate::error::{VmmError, VmmResult};

const FIT_POLICY_ENV: &str = "ROCVMM_FIT_POLICY";
const MIN_BLOCK_SIZE_ENV: &str = "ROCVMM_MIN_BLOCK_SIZE";
const REUSE_ADDRESSES_ENV: &str = "ROCVMM_REUSE_ADDRESSES";
const STRICT_RELEASE_ENV: &str = "ROCVMM_STRICT_RELEASE";

/// Which capacity buckets may satisfy a best-fit query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitPolicy {
    /// Only blocks with remaining capacity strictly greater than the request
    #[default]
    StrictlyLarger,
    /// Blocks whose remaining capacity equals the request qualify too
    AllowExact,
}

impl FromStr for FitPolicy {
    type Err = VmmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" | "strictly-larger" | "greater" => Ok(FitPolicy::StrictlyLarger),
            "exact" | "allow-exact" => Ok(FitPolicy::AllowExact),
            other => Err(VmmError::InvalidConfiguration(format!(
                "{}: unknown fit policy '{}'",
                FIT_POLICY_ENV, other
            ))),
        }
    }
}

impl fmt::Display for FitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitPolicy::StrictlyLarger => write!(f, "strict"),
            FitPolicy::AllowExact => write!(f, "exact"),
        }
    }
}

/// Tunables of a [`DeviceAllocator`](crate::memory::DeviceAllocator)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Best-fit bucket selection
    pub fit_policy: FitPolicy,
    /// Lower bound for the capacity of blocks created by `alloc` (0 = size to the request)
    pub min_block_size: usize,
    /// Keep unmapped reservations and hand them to later allocations of the same size
    pub reuse_address_ranges: bool,
    /// Report releases of unknown or already-unmapped ranges as errors instead of warnings
    pub strict_release: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            fit_policy: FitPolicy::StrictlyLarger,
            min_block_size: 0,
            reuse_address_ranges: true,
            strict_release: true,
        }
    }
}

impl AllocatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fit_policy(mut self, fit_policy: FitPolicy) -> Self {
        self.fit_policy = fit_policy;
        self
    }

    pub fn with_min_block_size(mut self, min_block_size: usize) -> Self {
        self.min_block_size = min_block_size;
        self
    }

    pub fn with_reuse_address_ranges(mut self, reuse: bool) -> Self {
        self.reuse_address_ranges = reuse;
        self
    }

    pub fn with_strict_release(mut self, strict: bool) -> Self {
        self.strict_release = strict;
        self
    }

    /// Check the configuration for values the allocator cannot honour
    pub fn validate(&self) -> VmmResult<()> {
        if self.min_block_size > isize::MAX as usize {
            return Err(VmmError::InvalidConfiguration(format!(
                "min_block_size {} exceeds isize::MAX",
                self.min_block_size
            )));
        }
        Ok(())
    }

    /// Build a configuration from the `ROCVMM_*` environment variables
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    /// - `InvalidConfiguration` if a variable is set to an unparsable value
    pub fn from_env() -> VmmResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> VmmResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AllocatorConfig::default();

        if let Some(value) = lookup(FIT_POLICY_ENV) {
            config.fit_policy = value.parse()?;
        }
        if let Some(value) = lookup(MIN_BLOCK_SIZE_ENV) {
            config.min_block_size = parse_size(&value).ok_or_else(|| {
                VmmError::InvalidConfiguration(format!(
                    "{}: cannot parse size '{}'",
                    MIN_BLOCK_SIZE_ENV, value
                ))
            })?;
        }
        if let Some(value) = lookup(REUSE_ADDRESSES_ENV) {
            config.reuse_address_ranges = parse_bool(REUSE_ADDRESSES_ENV, &value)?;
        }
        if let Some(value) = lookup(STRICT_RELEASE_ENV) {
            config.strict_release = parse_bool(STRICT_RELEASE_ENV, &value)?;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Parse a byte count such as `4096`, `64K`, `2M` or `1G` (binary multiples)
pub fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let upper = s.to_ascii_uppercase();
    let trimmed = upper.strip_suffix('B').unwrap_or(&upper);
    let (digits, shift) = match trimmed.chars().last()? {
        'K' => (&trimmed[..trimmed.len() - 1], 10),
        'M' => (&trimmed[..trimmed.len() - 1], 20),
        'G' => (&trimmed[..trimmed.len() - 1], 30),
        _ => (trimmed, 0),
    };
    let value: usize = digits.trim().parse().ok()?;
    value.checked_mul(1usize << shift)
}

fn parse_bool(key: &str, value: &str) -> VmmResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(VmmError::InvalidConfiguration(format!(
            "{}: expected a boolean, got '{}'",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AllocatorConfig::default();
        assert_eq!(config.fit_policy, FitPolicy::StrictlyLarger);
        assert_eq!(config.min_block_size, 0);
        assert!(config.reuse_address_ranges);
        assert!(config.strict_release);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = AllocatorConfig::new()
            .with_fit_policy(FitPolicy::AllowExact)
            .with_min_block_size(1 << 20)
            .with_reuse_address_ranges(false)
            .with_strict_release(false);

        assert_eq!(config.fit_policy, FitPolicy::AllowExact);
        assert_eq!(config.min_block_size, 1 << 20);
        assert!(!config.reuse_address_ranges);
        assert!(!config.strict_release);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("64K"), Some(64 * 1024));
        assert_eq!(parse_size("2m"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("1G"), Some(1 << 30));
        assert_eq!(parse_size("16MB"), Some(16 << 20));
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("lots"), None);
    }

    #[test]
    fn test_fit_policy_from_str() {
        assert_eq!("strict".parse::<FitPolicy>().unwrap(), FitPolicy::StrictlyLarger);
        assert_eq!("EXACT".parse::<FitPolicy>().unwrap(), FitPolicy::AllowExact);
        assert!("closest".parse::<FitPolicy>().is_err());
    }

    #[test]
    fn test_from_lookup() {
        let config = AllocatorConfig::from_lookup(lookup_from(&[
            ("ROCVMM_FIT_POLICY", "exact"),
            ("ROCVMM_MIN_BLOCK_SIZE", "2M"),
            ("ROCVMM_REUSE_ADDRESSES", "off"),
            ("ROCVMM_STRICT_RELEASE", "0"),
        ]))
        .unwrap();

        assert_eq!(config.fit_policy, FitPolicy::AllowExact);
        assert_eq!(config.min_block_size, 2 << 20);
        assert!(!config.reuse_address_ranges);
        assert!(!config.strict_release);
    }

    #[test]
    fn test_from_lookup_empty_keeps_defaults() {
        let config = AllocatorConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, AllocatorConfig::default());
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = AllocatorConfig::from_lookup(lookup_from(&[("ROCVMM_STRICT_RELEASE", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, VmmError::InvalidConfiguration(_)));

        let err = AllocatorConfig::from_lookup(lookup_from(&[("ROCVMM_MIN_BLOCK_SIZE", "12Q")]))
            .unwrap_err();
        assert!(matches!(err, VmmError::InvalidConfiguration(_)));
    }
}
