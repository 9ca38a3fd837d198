use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

pub const DEFAULT_QUIC_PORT: u16 = 22000;
pub const DEFAULT_STUN_PORT: u16 = natquic_core::stun::DEFAULT_PORT;

/// Keyword in [`Options::stun_servers`] that expands to [`DEFAULT_STUN_SERVERS`].
pub const DEFAULT_KEYWORD: &str = "default";

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.callwithus.com:3478",
    "stun.counterpath.com:3478",
    "stun.counterpath.net:3478",
    "stun.ekiga.net:3478",
    "stun.ideasip.com:3478",
    "stun.internetcalls.com:3478",
    "stun.schlund.de:3478",
    "stun.sipgate.net:10000",
    "stun.sipgate.net:3478",
    "stun.voip.aebc.com:3478",
    "stun.voiparound.com:3478",
    "stun.voipbuster.com:3478",
    "stun.voipstunt.com:3478",
    "stun.xten.com:3478",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Seconds between STUN keepalives. Values below 1 disable discovery.
    pub stun_keepalive_s: i64,
    pub nat_enabled: bool,
    pub stun_servers: Vec<String>,
    pub quic_keep_alive_interval: Duration,
    pub quic_max_idle_timeout: Duration,
    /// How long an accepted QUIC connection may take to open its first stream.
    pub stream_accept_timeout: Duration,
    /// Accepted connections that may be in flight before the next one is
    /// taken: handshaking, waiting for a stream or waiting on the intake.
    pub accept_backlog: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            stun_keepalive_s: 24,
            nat_enabled: true,
            stun_servers: vec![DEFAULT_KEYWORD.to_string()],
            quic_keep_alive_interval: Duration::from_secs(15),
            quic_max_idle_timeout: Duration::from_secs(30),
            stream_accept_timeout: Duration::from_secs(10),
            accept_backlog: 16,
        }
    }
}

impl Options {
    pub fn set_stun_keepalive_s(mut self, stun_keepalive_s: i64) -> Self {
        self.stun_keepalive_s = stun_keepalive_s;
        self
    }
    pub fn set_nat_enabled(mut self, nat_enabled: bool) -> Self {
        self.nat_enabled = nat_enabled;
        self
    }
    pub fn set_stun_servers(mut self, stun_servers: Vec<String>) -> Self {
        self.stun_servers = stun_servers;
        self
    }
    pub fn set_quic_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.quic_keep_alive_interval = interval;
        self
    }
    pub fn set_quic_max_idle_timeout(mut self, timeout: Duration) -> Self {
        self.quic_max_idle_timeout = timeout;
        self
    }
    pub fn set_stream_accept_timeout(mut self, timeout: Duration) -> Self {
        self.stream_accept_timeout = timeout;
        self
    }
    pub fn set_accept_backlog(mut self, accept_backlog: usize) -> Self {
        self.accept_backlog = accept_backlog;
        self
    }

    pub fn discovery_enabled(&self) -> bool {
        self.stun_keepalive_s >= 1 && self.nat_enabled
    }
    pub fn stun_keepalive(&self) -> Duration {
        Duration::from_secs(self.stun_keepalive_s.max(0) as u64)
    }
}

/// Shared, mutable configuration handle.
///
/// Readers take a snapshot on every access, so changes made through
/// [`ConfigWrapper::modify`] are seen at the next read.
#[derive(Clone, Default)]
pub struct ConfigWrapper {
    options: Arc<RwLock<Options>>,
}

impl ConfigWrapper {
    pub fn new(options: Options) -> Self {
        Self {
            options: Arc::new(RwLock::new(options)),
        }
    }
    pub fn options(&self) -> Options {
        self.options.read().clone()
    }
    pub fn modify<F: FnOnce(&mut Options)>(&self, f: F) {
        f(&mut self.options.write());
    }

    /// Configured STUN servers with `default` expanded and the STUN port
    /// appended where none was given.
    pub fn stun_servers(&self) -> Vec<String> {
        let configured = self.options.read().stun_servers.clone();
        let mut servers = Vec::with_capacity(configured.len());
        for server in configured {
            let server = server.trim();
            if server.is_empty() {
                continue;
            }
            if server == DEFAULT_KEYWORD {
                servers.extend(DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()));
                continue;
            }
            servers.push(with_default_port(server));
        }
        servers
    }
}

fn with_default_port(server: &str) -> String {
    let has_port = if server.starts_with('[') {
        !server.ends_with(']')
    } else {
        server.contains(':')
    };
    if has_port {
        server.to_string()
    } else {
        format!("{server}:{DEFAULT_STUN_PORT}")
    }
}
