//! Environment variable substitution for configuration documents
//!
//! References use `${VAR_NAME}`; `${VAR_NAME:-fallback}` supplies a value
//! for when the variable is unset or empty.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::env;

use crate::config::ConfigError;

/// Matches `${VAR}` and `${VAR:-default}`
static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .unwrap_or_else(|e| panic!("invalid env var pattern: {}", e))
});

/// Substitute environment variable references in a string.
///
/// Returns an error listing every referenced variable that is unset and
/// has no fallback.
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing_vars: Vec<String> = Vec::new();

    let result = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures<'_>| {
        let name = &caps[1];
        match (env::var(name), caps.get(2)) {
            (Ok(value), _) if !value.is_empty() => value,
            (_, Some(fallback)) => fallback.as_str().to_string(),
            (Ok(value), None) => value,
            (Err(_), None) => {
                if !missing_vars.iter().any(|m| m == name) {
                    missing_vars.push(name.to_string());
                }
                String::new()
            }
        }
    });

    if !missing_vars.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Missing environment variables: {}",
            missing_vars.join(", ")
        )));
    }

    Ok(result.into_owned())
}
