use common::config::{env_millis, env_parse};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
/// Sin heartbeat durante este tiempo el worker se da por muerto.
pub const WORKER_DEAD_TIMEOUT: Duration = Duration::from_secs(20);
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub bind_addr: SocketAddr,

    #[serde(with = "common::config::millis")]
    pub worker_dead_timeout: Duration,

    #[serde(with = "common::config::millis")]
    pub monitor_interval: Duration,

    /// Timeout de las llamadas a los workers.
    #[serde(with = "common::config::millis")]
    pub rpc_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080))),
            worker_dead_timeout: WORKER_DEAD_TIMEOUT,
            monitor_interval: MONITOR_INTERVAL,
            rpc_timeout: common::http::DEFAULT_RPC_TIMEOUT,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_addr: env_parse("COORDINATOR_BIND", d.bind_addr),
            worker_dead_timeout: env_millis("WORKER_DEAD_TIMEOUT_MS", d.worker_dead_timeout),
            monitor_interval: env_millis("MONITOR_INTERVAL_MS", d.monitor_interval),
            rpc_timeout: env_millis("RPC_TIMEOUT_MS", d.rpc_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let c = CoordinatorConfig::default();
        assert_eq!(c.bind_addr.port(), 8080);
        assert_eq!(c.worker_dead_timeout, Duration::from_secs(20));
        assert_eq!(c.monitor_interval, Duration::from_secs(1));
    }

    #[test]
    fn durations_travel_as_millis() {
        let c = CoordinatorConfig::default();
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["worker_dead_timeout"], 20_000);
        let back: CoordinatorConfig = serde_json::from_value(v).unwrap();
        assert_eq!(back.monitor_interval, c.monitor_interval);
    }
}
