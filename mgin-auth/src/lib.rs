// First-frame credential handshake (§4.2, §3.4). A session is trusted the
// moment it supplies a username/password pair matching `Config`'s
// `USERNAME`/`PASSWORD` keys; when either is left blank in config, no
// handshake is required at all and every connection is accepted.

use mgin_base::{err, Result};
use mgin_config::Config;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Whether the server is configured to require a handshake at all.
pub fn auth_required(config: &Config) -> bool {
    !config.get_str("USERNAME").is_empty() && !config.get_str("PASSWORD").is_empty()
}

/// Validate a parsed first frame against configured credentials. Called
/// only when `auth_required` is true; logs the outcome the way a
/// connection accept/reject is logged elsewhere.
pub fn authenticate(config: &Config, creds: &Credentials) -> Result<()> {
    if creds.username == config.get_str("USERNAME") && creds.password == config.get_str("PASSWORD") {
        info!(target: "mgin", "session authenticated");
        Ok(())
    } else {
        warn!(target: "mgin", "session rejected: bad credentials");
        Err(err("Invalid username or password"))
    }
}

/// Parse the first frame of a session as a credentials payload, when one
/// is required. Any frame that doesn't decode as `{username, password}`
/// is treated as a failed handshake, not a protocol error.
pub fn parse_credentials(frame: &str) -> Result<Credentials> {
    serde_json::from_str(frame).map_err(|_| err("First message must supply username and password"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(username: &str, password: &str) -> Config {
        let mut config = Config::defaults();
        config.set_path(std::env::temp_dir().join("mgin-auth-test-conf.json"));
        config.set("USERNAME", mgin_base::Value::Str(username.into())).unwrap();
        config.set("PASSWORD", mgin_base::Value::Str(password.into())).unwrap();
        config
    }

    #[test]
    fn blank_credentials_do_not_require_auth() {
        let config = config_with("", "");
        assert!(!auth_required(&config));
    }

    #[test]
    fn matching_credentials_authenticate() {
        let config = config_with("admin", "secret");
        let creds = Credentials { username: "admin".into(), password: "secret".into() };
        assert!(authenticate(&config, &creds).is_ok());
    }

    #[test]
    fn mismatched_credentials_are_rejected() {
        let config = config_with("admin", "secret");
        let creds = Credentials { username: "admin".into(), password: "wrong".into() };
        assert!(authenticate(&config, &creds).is_err());
    }

    #[test]
    fn non_json_frame_fails_to_parse() {
        assert!(parse_credentials("not json").is_err());
    }
}
