pub mod server;
pub mod tracing;

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Application environment, selects the log format
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development, // Local dev, pretty logs
    Production,  // JSON logs
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Helper to load and parse environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper to parse an optional environment variable into any `FromStr` type
pub fn env_parse_optional<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::ParseError {
                    key: key.to_string(),
                    details: e.to_string(),
                })
        }
        _ => Ok(None),
    }
}

/// Helper to parse an environment variable, falling back to `default` when unset
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(env_parse_optional(key)?.unwrap_or(default))
}

/// Helper to read a duration given in milliseconds
pub fn env_duration_ms(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(env_parse_optional::<u64>(key)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}

/// Helper to read a comma separated list, skipping empty entries
pub fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_to_development() {
        temp_env::with_var_unset("APP_ENV", || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
            assert!(env.is_development());
            assert!(!env.is_production());
        });
    }

    #[test]
    fn test_environment_production() {
        temp_env::with_var("APP_ENV", Some("production"), || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Production);
            assert!(env.is_production());
            assert!(!env.is_development());
        });
    }

    #[test]
    fn test_environment_production_case_insensitive() {
        temp_env::with_var("APP_ENV", Some("PRODUCTION"), || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Production);
        });

        temp_env::with_var("APP_ENV", Some("Production"), || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Production);
        });
    }

    #[test]
    fn test_environment_unknown_defaults_to_development() {
        temp_env::with_var("APP_ENV", Some("staging"), || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
        });
    }

    #[test]
    fn test_env_or_default_with_value() {
        temp_env::with_var("TEST_VAR", Some("test_value"), || {
            let result = env_or_default("TEST_VAR", "default");
            assert_eq!(result, "test_value");
        });
    }

    #[test]
    fn test_env_or_default_without_value() {
        temp_env::with_var_unset("MISSING_VAR", || {
            let result = env_or_default("MISSING_VAR", "default_value");
            assert_eq!(result, "default_value");
        });
    }


    #[test]
    fn test_env_parse_with_default() {
        temp_env::with_var_unset("PARSE_VAR", || {
            assert_eq!(env_parse("PARSE_VAR", 7u32).unwrap(), 7);
        });
        temp_env::with_var("PARSE_VAR", Some(" 42 "), || {
            assert_eq!(env_parse("PARSE_VAR", 7u32).unwrap(), 42);
        });
    }

    #[test]
    fn test_env_parse_invalid() {
        temp_env::with_var("PARSE_BAD", Some("many"), || {
            let err = env_parse("PARSE_BAD", 1u16).unwrap_err();
            assert!(err.to_string().contains("PARSE_BAD"));
        });
    }

    #[test]
    fn test_env_parse_optional_blank_is_none() {
        temp_env::with_var("OPTIONAL_VAR", Some("  "), || {
            assert_eq!(env_parse_optional::<u64>("OPTIONAL_VAR").unwrap(), None);
        });
    }

    #[test]
    fn test_env_duration_ms() {
        temp_env::with_var("DURATION_VAR", Some("250"), || {
            assert_eq!(
                env_duration_ms("DURATION_VAR", Duration::from_secs(1)).unwrap(),
                Duration::from_millis(250)
            );
        });
    }

    #[test]
    fn test_env_list() {
        temp_env::with_var("LIST_VAR", Some("orders, invoices,,audit "), || {
            assert_eq!(env_list("LIST_VAR"), vec!["orders", "invoices", "audit"]);
        });
        temp_env::with_var_unset("LIST_VAR", || {
            assert!(env_list("LIST_VAR").is_empty());
        });
    }
}
