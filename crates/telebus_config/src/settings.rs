use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration for both the broker and the agent.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub wal: WalSettings,
    pub trust: TrustSettings,
    pub client: ClientSettings,
    pub log: LogSettings,
}

/// Where the broker listens, and its mTLS material when enabled.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub tls: Option<ServerTlsSettings>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerTlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// CA that client certificates must chain to.
    pub client_ca_path: PathBuf,
}

/// Ingestion pipeline limits.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub max_envelope_bytes: usize,
    pub dedup_ttl_secs: u64,
    pub dedup_capacity: usize,
    pub overload_threshold: usize,
    pub retry_after_base_ms: u64,
    pub retry_after_max_ms: u64,
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WalSettings {
    pub path: PathBuf,
}

/// Producer id → hex Ed25519 public key.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct TrustSettings {
    pub producers: HashMap<String, String>,
}

/// Agent side: where to publish, who we are, where to buffer.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ClientSettings {
    pub broker_url: String,
    pub producer_id: String,
    pub signing_key_path: PathBuf,
    pub buffer_path: PathBuf,
    pub request_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter: f64,
    pub drain_interval_ms: u64,
    pub tls: Option<ClientTlsSettings>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ClientTlsSettings {
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub server_name: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration as read from files and the environment.
///
/// Every field is optional; `Settings::merge` fills the gaps from defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub wal: Option<PartialWalSettings>,
    pub trust: Option<PartialTrustSettings>,
    pub client: Option<PartialClientSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<ServerTlsSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub max_envelope_bytes: Option<usize>,
    pub dedup_ttl_secs: Option<u64>,
    pub dedup_capacity: Option<usize>,
    pub overload_threshold: Option<usize>,
    pub retry_after_base_ms: Option<u64>,
    pub retry_after_max_ms: Option<u64>,
    pub maintenance_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialWalSettings {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialTrustSettings {
    pub producers: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialClientSettings {
    pub broker_url: Option<String>,
    pub producer_id: Option<String>,
    pub signing_key_path: Option<PathBuf>,
    pub buffer_path: Option<PathBuf>,
    pub request_timeout_ms: Option<u64>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub backoff_jitter: Option<f64>,
    pub drain_interval_ms: Option<u64>,
    pub tls: Option<ClientTlsSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 7400,
                tls: None,
            },
            broker: BrokerSettings {
                max_envelope_bytes: 128 * 1024,
                dedup_ttl_secs: 300,
                dedup_capacity: 50_000,
                overload_threshold: 1024,
                retry_after_base_ms: 50,
                retry_after_max_ms: 5_000,
                maintenance_interval_secs: 30,
            },
            wal: WalSettings {
                path: PathBuf::from("data/wal"),
            },
            trust: TrustSettings::default(),
            client: ClientSettings {
                broker_url: "ws://127.0.0.1:7400".to_string(),
                producer_id: "agent-1".to_string(),
                signing_key_path: PathBuf::from("keys/agent.key"),
                buffer_path: PathBuf::from("data/agent-buffer"),
                request_timeout_ms: 5_000,
                backoff_base_ms: 200,
                backoff_max_ms: 30_000,
                backoff_jitter: 0.2,
                drain_interval_ms: 500,
                tls: None,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Overlay whatever `partial` sets on top of `self`.
    pub fn merge(self, partial: PartialSettings) -> Settings {
        let Settings {
            server,
            broker,
            wal,
            trust,
            client,
            log,
        } = self;

        let server = match partial.server {
            Some(p) => ServerSettings {
                host: p.host.unwrap_or(server.host),
                port: p.port.unwrap_or(server.port),
                tls: p.tls.or(server.tls),
            },
            None => server,
        };

        let broker = match partial.broker {
            Some(p) => BrokerSettings {
                max_envelope_bytes: p.max_envelope_bytes.unwrap_or(broker.max_envelope_bytes),
                dedup_ttl_secs: p.dedup_ttl_secs.unwrap_or(broker.dedup_ttl_secs),
                dedup_capacity: p.dedup_capacity.unwrap_or(broker.dedup_capacity),
                overload_threshold: p.overload_threshold.unwrap_or(broker.overload_threshold),
                retry_after_base_ms: p.retry_after_base_ms.unwrap_or(broker.retry_after_base_ms),
                retry_after_max_ms: p.retry_after_max_ms.unwrap_or(broker.retry_after_max_ms),
                maintenance_interval_secs: p
                    .maintenance_interval_secs
                    .unwrap_or(broker.maintenance_interval_secs),
            },
            None => broker,
        };

        let wal = WalSettings {
            path: partial.wal.and_then(|w| w.path).unwrap_or(wal.path),
        };

        let trust = TrustSettings {
            producers: partial
                .trust
                .and_then(|t| t.producers)
                .unwrap_or(trust.producers),
        };

        let client = match partial.client {
            Some(p) => ClientSettings {
                broker_url: p.broker_url.unwrap_or(client.broker_url),
                producer_id: p.producer_id.unwrap_or(client.producer_id),
                signing_key_path: p.signing_key_path.unwrap_or(client.signing_key_path),
                buffer_path: p.buffer_path.unwrap_or(client.buffer_path),
                request_timeout_ms: p.request_timeout_ms.unwrap_or(client.request_timeout_ms),
                backoff_base_ms: p.backoff_base_ms.unwrap_or(client.backoff_base_ms),
                backoff_max_ms: p.backoff_max_ms.unwrap_or(client.backoff_max_ms),
                backoff_jitter: p.backoff_jitter.unwrap_or(client.backoff_jitter),
                drain_interval_ms: p.drain_interval_ms.unwrap_or(client.drain_interval_ms),
                tls: p.tls.or(client.tls),
            },
            None => client,
        };

        let log = LogSettings {
            level: partial.log.and_then(|l| l.level).unwrap_or(log.level),
        };

        Settings {
            server,
            broker,
            wal,
            trust,
            client,
            log,
        }
    }
}

impl ServerSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl BrokerSettings {
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn retry_after_base(&self) -> Duration {
        Duration::from_millis(self.retry_after_base_ms)
    }

    pub fn retry_after_max(&self) -> Duration {
        Duration::from_millis(self.retry_after_max_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }
}
