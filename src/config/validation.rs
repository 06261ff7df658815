//! Configuration errors and value helpers.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("config validation error: {0}")]
    Invalid(String),
}

/// Expand `${VAR}` and `${VAR:-default}` from the process environment.
/// Unset variables without a default expand to the empty string.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR: OnceLock<Regex> = OnceLock::new();

    let regex = ENV_VAR.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile env var regex")
    });

    regex
        .replace_all(input, |caps: &Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| {
                caps.get(2)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default()
            })
        })
        .into_owned()
}

/// [`expand_env_vars`] over an optional field; an expansion to nothing
/// becomes `None`.
pub(crate) fn expand_optional(value: Option<&str>) -> Option<String> {
    value.map(expand_env_vars).filter(|v| !v.trim().is_empty())
}

/// Parse an upstream base URL; only `http` and `https` are accepted.
pub(crate) fn parse_http_url(owner: &str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::Invalid(format!("{owner}: invalid URL '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::Invalid(format!(
            "{owner}: unsupported URL scheme '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars_plain() {
        assert_eq!(expand_env_vars("msh/US/#"), "msh/US/#");
    }

    #[test]
    fn test_expand_env_vars_default() {
        let result = expand_env_vars("${NONEXISTENT_MESH_PASSWORD_4821:-large4cats}");
        assert_eq!(result, "large4cats");
        assert_eq!(expand_env_vars("${NONEXISTENT_MESH_PASSWORD_4821}"), "");
    }

    #[test]
    fn test_expand_env_vars_from_env() {
        // SAFETY: test-specific variable, not read elsewhere.
        unsafe {
            std::env::set_var("MESHMANAGER_TEST_TOKEN", "s3cret");
        }
        assert_eq!(
            expand_env_vars("Bearer ${MESHMANAGER_TEST_TOKEN:-unused}"),
            "Bearer s3cret"
        );
        // SAFETY: cleanup of the variable set above.
        unsafe {
            std::env::remove_var("MESHMANAGER_TEST_TOKEN");
        }
    }

    #[test]
    fn test_expand_optional_drops_empty() {
        assert_eq!(expand_optional(None), None);
        assert_eq!(expand_optional(Some("${NONEXISTENT_MESH_USER_4821}")), None);
        assert_eq!(expand_optional(Some("meshdev")), Some("meshdev".to_string()));
    }

    #[test]
    fn test_parse_http_url() {
        assert!(parse_http_url("source 'a'", "http://10.0.0.5:8080").is_ok());
        let err = parse_http_url("source 'a'", "ftp://host").unwrap_err();
        assert!(err.to_string().contains("unsupported URL scheme"));
        let err = parse_http_url("source 'a'", "nope").unwrap_err();
        assert!(err.to_string().contains("invalid URL"));
    }
}
