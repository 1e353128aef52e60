//! Key and Value Validation
//!
//! Two profiles: `Strict` keeps keys short and to a safe character set,
//! `Relaxed` only rules out empty keys and control characters.

use std::time::Duration;

use crate::cache::entry::estimate_size;
use crate::cache::{MAX_KEY_LENGTH, MAX_VALUE_SIZE};
use crate::config::ValidationProfile;
use crate::error::{CacheError, Result};

/// Key length allowed by the relaxed profile.
const RELAXED_MAX_KEY_LENGTH: usize = 1024;

/// Value size allowed by the relaxed profile.
const RELAXED_MAX_VALUE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct KeyValidator {
    profile: ValidationProfile,
    /// No single entry may be larger than a shard's byte bound
    max_entry_bytes: usize,
}

impl KeyValidator {
    pub fn new(profile: ValidationProfile, max_entry_bytes: usize) -> Self {
        Self {
            profile,
            max_entry_bytes,
        }
    }

    fn max_key_length(&self) -> usize {
        match self.profile {
            ValidationProfile::Strict => MAX_KEY_LENGTH,
            ValidationProfile::Relaxed => RELAXED_MAX_KEY_LENGTH,
        }
    }

    fn max_value_size(&self) -> usize {
        match self.profile {
            ValidationProfile::Strict => MAX_VALUE_SIZE,
            ValidationProfile::Relaxed => RELAXED_MAX_VALUE_SIZE,
        }
    }

    // == Keys ==
    pub fn validate_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(CacheError::Validation("key must not be empty".to_string()));
        }
        if key.len() > self.max_key_length() {
            return Err(CacheError::Validation(format!(
                "key exceeds maximum length of {} bytes",
                self.max_key_length()
            )));
        }
        let allowed = match self.profile {
            ValidationProfile::Strict => key.chars().all(is_strict_key_char),
            ValidationProfile::Relaxed => !key.chars().any(char::is_control),
        };
        if !allowed {
            return Err(CacheError::Validation(format!(
                "key '{}' contains characters not allowed by the {:?} profile",
                key.escape_debug(),
                self.profile
            )));
        }
        Ok(())
    }

    // == Values ==
    pub fn validate_value(&self, key: &str, value: &[u8]) -> Result<()> {
        if value.len() > self.max_value_size() {
            return Err(CacheError::Validation(format!(
                "value exceeds maximum size of {} bytes",
                self.max_value_size()
            )));
        }
        let size = estimate_size(key, value);
        if size > self.max_entry_bytes {
            return Err(CacheError::Validation(format!(
                "entry of {size} bytes can never fit a shard bound of {} bytes",
                self.max_entry_bytes
            )));
        }
        Ok(())
    }

    pub fn validate_ttl(&self, ttl: Option<Duration>) -> Result<()> {
        match ttl {
            Some(ttl) if ttl.is_zero() => Err(CacheError::Validation(
                "ttl must be greater than zero".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

fn is_strict_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.' | '/' | '@' | '#')
}
