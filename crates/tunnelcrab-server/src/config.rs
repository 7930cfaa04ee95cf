use std::time::Duration;

use serde::Deserialize;

use tunnelcrab_core::{Result, TunnelError};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserConfig {
    pub identifier: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub domain: String,
    pub secure: bool,
    pub timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub users: Vec<UserConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            domain: String::new(),
            secure: false,
            timeout_ms: 1000,
            idle_timeout_ms: 60_000,
            users: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Address to bind the HTTP listener to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Dispatch deadline used for each inbound HTTP request.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Surplus-idle-connection retirement threshold.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Load configuration from a TOML file at `path`. Falls back to
    /// defaults (no registered users, so nothing can register a tunnel
    /// until at least one is configured) if the file does not exist.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TunnelError::Other(format!("failed to read config: {e}")))?;
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(default)]
            server: ServerConfig,
        }
        let wrapper: Wrapper = toml::from_str(&raw)
            .map_err(|e| TunnelError::Other(format!("failed to parse config: {e}")))?;
        Ok(wrapper.server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_wsp_server() {
        let c = ServerConfig::default();
        assert_eq!(c.host, "127.0.0.1");
        assert_eq!(c.port, 8080);
        assert_eq!(c.timeout_ms, 1000);
        assert_eq!(c.idle_timeout_ms, 60_000);
        assert!(c.users.is_empty());
    }

    #[test]
    fn parses_full_toml() {
        let toml_str = r#"
[server]
host = "0.0.0.0"
port = 9090
domain = "example.com"
secure = true
timeout_ms = 2000
idle_timeout_ms = 30000

[[server.users]]
identifier = "alice"
secret_key = "s3cret"
"#;
        #[derive(Deserialize)]
        struct Wrapper {
            server: ServerConfig,
        }
        let wrapper: Wrapper = toml::from_str(toml_str).unwrap();
        let c = wrapper.server;
        assert_eq!(c.port, 9090);
        assert_eq!(c.domain, "example.com");
        assert!(c.secure);
        assert_eq!(c.users.len(), 1);
        assert_eq!(c.users[0].identifier, "alice");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let c = ServerConfig::load(std::path::Path::new("/nonexistent/path.toml")).unwrap();
        assert_eq!(c, ServerConfig::default());
    }
}
