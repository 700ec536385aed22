//! Broker token discovery from the environment.

use std::env;
use std::fs;
use std::io::ErrorKind;

use crate::Result;

pub const TOKEN_ENV_VAR: &str = "SEMGREP_NETWORK_BROKER_TOKEN";
pub const TOKEN_PATH_ENV_VAR: &str = "SEMGREP_NETWORK_BROKER_TOKEN_PATH";

/// Load the broker token from `SEMGREP_NETWORK_BROKER_TOKEN`, falling back
/// to the file named by `SEMGREP_NETWORK_BROKER_TOKEN_PATH`.
///
/// Returns `Ok(None)` when neither is set; a missing token file is treated
/// the same as an unset variable.
pub fn load_token_from_env() -> Result<Option<String>> {
    if let Ok(token) = env::var(TOKEN_ENV_VAR) {
        if !token.is_empty() {
            return Ok(Some(token.trim().to_string()));
        }
    }

    if let Ok(path) = env::var(TOKEN_PATH_ENV_VAR) {
        if !path.is_empty() {
            return match fs::read_to_string(&path) {
                Ok(data) => Ok(Some(data.trim().to_string())),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            };
        }
    }

    Ok(None)
}
