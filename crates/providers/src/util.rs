//! Shared utility functions for the provider adapter.

use sa_domain::error::{Error, Result};

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; everything else maps to
/// [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Resolve the API key for the configured LLM endpoint.
///
/// `api_key_env` names an environment variable holding the key; `None`
/// means the endpoint needs no authentication (e.g. a local Ollama server).
pub fn resolve_api_key(api_key_env: Option<&str>) -> Result<Option<String>> {
    let Some(var) = api_key_env else {
        return Ok(None);
    };
    std::env::var(var)
        .map(Some)
        .map_err(|_| Error::Config(format!("environment variable '{var}' not set or not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_env_var_configured_means_no_key() {
        assert_eq!(resolve_api_key(None).unwrap(), None);
    }

    #[test]
    fn resolves_from_configured_env_var() {
        let var_name = "SA_TEST_RESOLVE_API_KEY_1234";
        std::env::set_var(var_name, "secret-value");
        let result = resolve_api_key(Some(var_name)).unwrap();
        assert_eq!(result.as_deref(), Some("secret-value"));
        std::env::remove_var(var_name);
    }

    #[test]
    fn missing_env_var_is_an_error() {
        let err = resolve_api_key(Some("SA_TEST_NONEXISTENT_VAR_8888")).unwrap_err();
        assert!(err.to_string().contains("SA_TEST_NONEXISTENT_VAR_8888"));
    }
}
