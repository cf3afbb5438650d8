use std::time::Duration;

/// Default target for delay tests when the host sends none
pub const DEFAULT_TEST_URL: &str = "https://www.gstatic.com/generate_204";

/// Tunables of the bridge itself (not of the engine)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    memory_interval: Duration,
    connections_interval: Duration,
    delay_timeout: Duration,
    test_url: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            memory_interval: Duration::from_secs(2),
            connections_interval: Duration::from_secs(1),
            delay_timeout: Duration::from_millis(5000),
            test_url: DEFAULT_TEST_URL.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Create a new builder for BridgeConfig
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Period of the `memory` push stream
    pub fn memory_interval(&self) -> Duration {
        self.memory_interval
    }

    /// Period of the `connections` push stream
    pub fn connections_interval(&self) -> Duration {
        self.connections_interval
    }

    /// Delay-test timeout used when the host sends none
    pub fn delay_timeout(&self) -> Duration {
        self.delay_timeout
    }

    pub fn test_url(&self) -> &str {
        &self.test_url
    }
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    inner: BridgeConfig,
}

impl BridgeConfigBuilder {
    pub fn memory_interval(mut self, interval: Duration) -> Self {
        self.inner.memory_interval = interval;
        self
    }

    pub fn connections_interval(mut self, interval: Duration) -> Self {
        self.inner.connections_interval = interval;
        self
    }

    pub fn delay_timeout(mut self, timeout: Duration) -> Self {
        self.inner.delay_timeout = timeout;
        self
    }

    pub fn test_url(mut self, url: impl Into<String>) -> Self {
        self.inner.test_url = url.into();
        self
    }

    pub fn build(self) -> BridgeConfig {
        self.inner
    }
}
