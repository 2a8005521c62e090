//! Configuration management for Provis Core
//!
//! The engine reads its construction-time configuration (cache bounds,
//! GAL paging, clock skew) from the environment once; per-domain knobs
//! (auth mechanism, password policy, GAL mode) come from directory
//! attributes at operation time and are never configured here.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Entity cache bounds
    pub cache: CacheConfig,
    /// GAL federation defaults
    pub gal: GalConfig,
    /// Authentication tuning
    pub auth: AuthConfig,
}

/// Per-cache maximum size and maximum age
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub account_max_entries: usize,
    pub account_max_age: Duration,
    pub domain_max_entries: usize,
    pub domain_max_age: Duration,
    pub group_max_entries: usize,
    pub group_max_age: Duration,
    pub cos_max_entries: usize,
    pub cos_max_age: Duration,
    /// Access-control group cache, separate from the general group cache
    pub acl_group_max_entries: usize,
    pub acl_group_max_age: Duration,
    /// TTL for "known absent" domain lookups
    pub negative_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            account_max_entries: 5000,
            account_max_age: Duration::from_secs(15 * 60),
            domain_max_entries: 500,
            domain_max_age: Duration::from_secs(15 * 60),
            group_max_entries: 2000,
            group_max_age: Duration::from_secs(15 * 60),
            cos_max_entries: 100,
            cos_max_age: Duration::from_secs(15 * 60),
            acl_group_max_entries: 1000,
            acl_group_max_age: Duration::from_secs(15 * 60),
            negative_ttl: Duration::from_secs(15 * 60),
        }
    }
}

/// GAL search defaults
#[derive(Debug, Clone)]
pub struct GalConfig {
    /// Page size requested from the backing search
    pub page_size: u32,
    /// Default combined result cap when the domain sets none
    pub max_results: u32,
}

impl Default for GalConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_results: 100,
        }
    }
}

/// Authentication tuning
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Accepted clock skew for preauth timestamps
    pub preauth_max_skew: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            preauth_max_skew: Duration::from_secs(5 * 60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            gal: GalConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();
        Ok(Self {
            cache: CacheConfig {
                account_max_entries: env_usize(
                    "PROVIS_CACHE_ACCOUNT_MAX",
                    defaults.cache.account_max_entries,
                )?,
                account_max_age: env_secs(
                    "PROVIS_CACHE_ACCOUNT_AGE_SECS",
                    defaults.cache.account_max_age,
                )?,
                domain_max_entries: env_usize(
                    "PROVIS_CACHE_DOMAIN_MAX",
                    defaults.cache.domain_max_entries,
                )?,
                domain_max_age: env_secs(
                    "PROVIS_CACHE_DOMAIN_AGE_SECS",
                    defaults.cache.domain_max_age,
                )?,
                group_max_entries: env_usize(
                    "PROVIS_CACHE_GROUP_MAX",
                    defaults.cache.group_max_entries,
                )?,
                group_max_age: env_secs(
                    "PROVIS_CACHE_GROUP_AGE_SECS",
                    defaults.cache.group_max_age,
                )?,
                cos_max_entries: env_usize("PROVIS_CACHE_COS_MAX", defaults.cache.cos_max_entries)?,
                cos_max_age: env_secs("PROVIS_CACHE_COS_AGE_SECS", defaults.cache.cos_max_age)?,
                acl_group_max_entries: env_usize(
                    "PROVIS_CACHE_ACL_GROUP_MAX",
                    defaults.cache.acl_group_max_entries,
                )?,
                acl_group_max_age: env_secs(
                    "PROVIS_CACHE_ACL_GROUP_AGE_SECS",
                    defaults.cache.acl_group_max_age,
                )?,
                negative_ttl: env_secs(
                    "PROVIS_CACHE_NEGATIVE_TTL_SECS",
                    defaults.cache.negative_ttl,
                )?,
            },
            gal: GalConfig {
                page_size: env_u32("PROVIS_GAL_PAGE_SIZE", defaults.gal.page_size)?,
                max_results: env_u32("PROVIS_GAL_MAX_RESULTS", defaults.gal.max_results)?,
            },
            auth: AuthConfig {
                preauth_max_skew: env_secs(
                    "PROVIS_PREAUTH_MAX_SKEW_SECS",
                    defaults.auth.preauth_max_skew,
                )?,
            },
        })
    }
}

fn env_usize(name: &str, fallback: usize) -> Result<usize> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be an integer, got {raw:?}")),
        Err(_) => Ok(fallback),
    }
}

fn env_u32(name: &str, fallback: u32) -> Result<u32> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be an integer, got {raw:?}")),
        Err(_) => Ok(fallback),
    }
}

fn env_secs(name: &str, fallback: Duration) -> Result<Duration> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Duration::from_secs)
            .with_context(|| format!("{name} must be a number of seconds, got {raw:?}")),
        Err(_) => Ok(fallback),
    }
}
