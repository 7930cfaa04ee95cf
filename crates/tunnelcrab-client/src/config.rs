use rand::Rng;
use serde::Deserialize;

use tunnelcrab_core::{Result, TunnelError};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TunnelConfig {
    pub name: String,
    #[serde(default)]
    pub subdomain: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub target: String,
    pub pool_idle_size: u32,
    pub pool_max_size: u32,
    pub secret_key: String,
    pub tunnels: Vec<TunnelConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            pool_idle_size: 1,
            pool_max_size: 100,
            secret_key: String::new(),
            tunnels: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TunnelError::Other(format!("failed to read config: {e}")))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| TunnelError::Other(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.target.is_empty() {
            return Err(TunnelError::Other(
                "client config: `target` is required".into(),
            ));
        }
        if self.tunnels.is_empty() {
            return Err(TunnelError::Other(
                "client config: at least one [[tunnels]] entry is required".into(),
            ));
        }
        Ok(())
    }

    /// `target` normalized to end with `/register`, the way the original
    /// accepts either the bare server origin or the full endpoint.
    pub fn register_url(&self) -> String {
        let trimmed = self.target.trim_end_matches('/');
        if trimmed.ends_with("/register") {
            trimmed.to_string()
        } else {
            format!("{trimmed}/register")
        }
    }
}

impl TunnelConfig {
    /// Subdomain to register under, generating a random lowercase label
    /// (matching the original's `gonanoid` alphabet and length) when none
    /// was configured.
    pub fn subdomain_or_generate(&self) -> String {
        self.subdomain
            .clone()
            .unwrap_or_else(|| generate_subdomain(6))
    }
}

fn generate_subdomain(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_client_setdefaults() {
        let c = ClientConfig::default();
        assert_eq!(c.pool_idle_size, 1);
        assert_eq!(c.pool_max_size, 100);
    }

    #[test]
    fn register_url_appends_suffix_when_missing() {
        let mut c = ClientConfig::default();
        c.target = "wss://tunnel.example.com".into();
        assert_eq!(c.register_url(), "wss://tunnel.example.com/register");
    }

    #[test]
    fn register_url_left_alone_when_already_present() {
        let mut c = ClientConfig::default();
        c.target = "wss://tunnel.example.com/register".into();
        assert_eq!(c.register_url(), "wss://tunnel.example.com/register");
    }

    #[test]
    fn generated_subdomain_is_valid() {
        let tunnel = TunnelConfig {
            name: "web".into(),
            subdomain: None,
            port: 9999,
        };
        let s = tunnel.subdomain_or_generate();
        assert_eq!(s.len(), 6);
        assert!(tunnelcrab_core::is_valid_subdomain(&s));
    }

    #[test]
    fn rejects_missing_target() {
        let toml_str = r#"
secret_key = "s3cret"
[[tunnels]]
name = "web"
port = 9999
"#;
        let c: ClientConfig = toml::from_str(toml_str).unwrap();
        assert!(c.validate().is_err());
    }
}
