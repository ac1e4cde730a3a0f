use std::time::Duration;

/// HTTP server settings.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind. `0.0.0.0` listens on every interface.
    pub host: String,
    /// Port to bind. `0` picks a free port.
    pub port: u16,
    /// Longest prompt accepted by `POST /sessions`, in characters.
    pub max_prompt_chars: usize,
    /// Interval between keep-alive comments on idle event streams.
    pub keepalive_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 10000,
            max_prompt_chars: 4000,
            keepalive_interval: Duration::from_secs(15),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_host() {
        assert_eq!(ServerConfig::default().host, "0.0.0.0");
    }

    #[test]
    fn default_port() {
        assert_eq!(ServerConfig::default().port, 10000);
    }

    #[test]
    fn default_prompt_limit() {
        assert_eq!(ServerConfig::default().max_prompt_chars, 4000);
    }

    #[test]
    fn bind_addr_joins_host_and_port() {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        assert_eq!(config.bind_addr(), "127.0.0.1:0");
    }
}
