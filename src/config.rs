//! Process configuration. Two environment variables, no persistence, no
//! config crate — matches the surface a small relay actually needs.

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_BASE_DOMAIN: &str = "agent.osaurus.ai";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub base_domain: String,
}

impl Config {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let base_domain = std::env::var("BASE_DOMAIN").unwrap_or_else(|_| DEFAULT_BASE_DOMAIN.to_string());
        Self { port, base_domain }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        std::env::remove_var("PORT");
        std::env::remove_var("BASE_DOMAIN");
        let config = Config::from_env();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.base_domain, DEFAULT_BASE_DOMAIN);
    }
}
