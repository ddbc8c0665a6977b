/// Listening settings for the log receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub host: String,
    pub port: u16,
    pub tcp_nodelay: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            tcp_nodelay: false,
        }
    }
}

impl ReceiverConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn with_tcp_nodelay(mut self, no_delay: bool) -> Self {
        self.tcp_nodelay = no_delay;
        self
    }

    /// `host:port`, as handed to `Server::new`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_all_interfaces_on_8081() {
        let config = ReceiverConfig::default();
        assert_eq!(config.addr(), "0.0.0.0:8081");
        assert!(!config.tcp_nodelay);
    }

    #[test]
    fn builder_overrides() {
        let config = ReceiverConfig::default()
            .with_host("127.0.0.1")
            .with_port(9000)
            .with_tcp_nodelay(true);
        assert_eq!(config.addr(), "127.0.0.1:9000");
        assert!(config.tcp_nodelay);
    }
}
