use serde::Deserialize;
use std::path::Path;

/// Global configuration for the gateway.
///
/// Built once at startup and shared immutably by all requests; nothing in
/// here is mutated after `main` finishes loading it.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream application the `/streamlit` prefix forwards to
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Locally served content (dashboard page, static assets)
    #[serde(default)]
    pub content: ContentConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listening port (default: 3000, overridable via the PORT env var)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Upstream host (default: localhost)
    #[serde(default = "default_upstream_host")]
    pub host: String,

    /// Upstream port (default: 5000)
    #[serde(default = "default_upstream_port")]
    pub port: u16,

    /// Path prefix that routes to the upstream, stripped before forwarding
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,
}

impl UpstreamConfig {
    /// The `host:port` authority the upstream sees in the Host header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_upstream_host(),
            port: default_upstream_port(),
            route_prefix: default_route_prefix(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContentConfig {
    /// Directory served under the static prefix
    #[serde(default = "default_static_dir")]
    pub static_dir: String,

    /// URL prefix for static assets
    #[serde(default = "default_static_prefix")]
    pub static_prefix: String,

    /// HTML document returned for `/`
    #[serde(default = "default_index_page")]
    pub index_page: String,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            static_dir: default_static_dir(),
            static_prefix: default_static_prefix(),
            index_page: default_index_page(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    3000
}

fn default_upstream_host() -> String {
    "localhost".to_string()
}

fn default_upstream_port() -> u16 {
    5000
}

fn default_route_prefix() -> String {
    "/streamlit".to_string()
}

fn default_static_dir() -> String {
    "static".to_string()
}

fn default_static_prefix() -> String {
    "/static".to_string()
}

fn default_index_page() -> String {
    "assets/dashboard.html".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is absent,
    /// then apply environment overrides (PORT).
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Config::default()
        };

        if let Ok(port) = std::env::var("PORT") {
            config.server.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid PORT environment variable '{}': {}", port, e))?;
        }

        Ok(config)
    }
}
