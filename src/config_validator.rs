use crate::error::Error;

/// Validates configuration values that the derive-based checks don't cover
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<(), Error> {
        if url.is_empty() {
            return Err(Error::InvalidConfiguration(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if !url.starts_with("redis://")
            && !url.starts_with("rediss://")
            && !url.starts_with("redis+unix://")
            && !url.starts_with("unix://")
        {
            return Err(Error::InvalidConfiguration(
                "Redis URL must start with 'redis://', 'rediss://' or 'unix://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates a key namespace prefix
    pub fn validate_namespace(namespace: &str) -> Result<(), Error> {
        if namespace.is_empty() {
            return Err(Error::InvalidConfiguration(
                "Key namespace cannot be empty when set".to_string(),
            ));
        }

        if namespace.chars().any(char::is_whitespace) {
            return Err(Error::InvalidConfiguration(format!(
                "Key namespace '{}' cannot contain whitespace",
                namespace
            )));
        }

        Ok(())
    }

    /// Validates a bucket key
    pub fn validate_key(key: &str) -> Result<(), Error> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }

        Ok(())
    }
}
