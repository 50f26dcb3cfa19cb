use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use crate::common::{
    Id, DEFAULT_BUCKET_SIZE, DEFAULT_DEPTH_MODULO, DEFAULT_STALENESS_TIMEOUT, MAX_VALUES,
};
use crate::{Error, Result};

/// Default number of concurrent requests per lookup round.
pub const DEFAULT_ALPHA: usize = 3;
/// Default time to wait for a response before considering a peer unresponsive.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// This node's [Id].
    ///
    /// Defaults to None, where a random Id is generated from the node's
    /// random source (see [Config::seed]).
    pub node_id: Option<Id>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, where the operating system assigns a free port.
    pub port: Option<u16>,
    /// Interface to bind the UDP socket to.
    ///
    /// Defaults to `0.0.0.0`
    pub interface: Ipv4Addr,
    /// Peers to contact during bootstrap.
    ///
    /// Defaults to empty, making this node the first one of its network.
    pub initial_peers: Vec<SocketAddrV4>,
    /// Maximum number of nodes per routing table bucket, and the number of
    /// nearest nodes returned by lookups.
    ///
    /// Defaults to [DEFAULT_BUCKET_SIZE]
    pub bucket_size: usize,
    /// Number of nearest nodes a value is stored at by [crate::Dht::set].
    ///
    /// Defaults to None, meaning [Config::bucket_size].
    pub num_replicas: Option<usize>,
    /// Buckets not covering this node's id are still split while their
    /// depth is not a multiple of this value.
    ///
    /// Defaults to [DEFAULT_DEPTH_MODULO]
    pub depth_modulo: usize,
    /// Number of concurrent requests per lookup round.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// Maximum number of rounds per lookup.
    ///
    /// Defaults to None, where lookups run until they converge.
    pub max_rounds: Option<usize>,
    /// How long to wait for a response, also bounds each lookup round.
    ///
    /// The longer this duration is, the longer lookups take when peers are
    /// unresponsive. The shorter it is, the more responses from busy peers
    /// we miss out on.
    ///
    /// Defaults to [DEFAULT_WAIT_TIMEOUT]
    pub wait_timeout: Duration,
    /// Buckets that saw no activity for this long are refreshed with a lookup.
    ///
    /// Defaults to [DEFAULT_STALENESS_TIMEOUT], `None` disables refreshing.
    pub staleness_timeout: Option<Duration>,
    /// Time after the start of bootstrap to stop waiting for the remaining
    /// initial peers once the first one responded.
    ///
    /// Defaults to None, meaning [Config::wait_timeout].
    pub bootstrap_timeout: Option<Duration>,
    /// Maximum number of records held in the local store.
    ///
    /// Defaults to [MAX_VALUES]
    pub max_stored_values: usize,
    /// Seed for the node's random source, for reproducible ids and refresh
    /// targets.
    ///
    /// Defaults to None, seeding from system entropy.
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: None,
            port: None,
            interface: Ipv4Addr::UNSPECIFIED,
            initial_peers: Vec::new(),
            bucket_size: DEFAULT_BUCKET_SIZE,
            num_replicas: None,
            depth_modulo: DEFAULT_DEPTH_MODULO,
            alpha: DEFAULT_ALPHA,
            max_rounds: None,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            staleness_timeout: Some(DEFAULT_STALENESS_TIMEOUT),
            bootstrap_timeout: None,
            max_stored_values: MAX_VALUES,
            seed: None,
        }
    }
}

impl Config {
    /// Reject configurations that can not produce a working node.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_size == 0 {
            return Err(Error::InvalidConfig("bucket_size must be at least 1"));
        }
        if self.num_replicas == Some(0) {
            return Err(Error::InvalidConfig("num_replicas must be at least 1"));
        }
        if self.depth_modulo == 0 {
            return Err(Error::InvalidConfig("depth_modulo must be at least 1"));
        }
        if self.alpha == 0 {
            return Err(Error::InvalidConfig("alpha must be at least 1"));
        }
        if self.max_rounds == Some(0) {
            return Err(Error::InvalidConfig("max_rounds must be at least 1"));
        }
        if self.wait_timeout.is_zero() {
            return Err(Error::InvalidConfig("wait_timeout must be positive"));
        }
        if self.max_stored_values == 0 {
            return Err(Error::InvalidConfig("max_stored_values must be at least 1"));
        }

        Ok(())
    }

    pub(crate) fn num_replicas(&self) -> usize {
        self.num_replicas.unwrap_or(self.bucket_size)
    }

    pub(crate) fn bootstrap_timeout(&self) -> Duration {
        self.bootstrap_timeout.unwrap_or(self.wait_timeout)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = Config::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.num_replicas(), config.bucket_size);
        assert_eq!(config.bootstrap_timeout(), config.wait_timeout);
    }

    #[test]
    fn reject_zero_values() {
        let invalid = [
            Config {
                bucket_size: 0,
                ..Default::default()
            },
            Config {
                num_replicas: Some(0),
                ..Default::default()
            },
            Config {
                depth_modulo: 0,
                ..Default::default()
            },
            Config {
                alpha: 0,
                ..Default::default()
            },
            Config {
                wait_timeout: Duration::ZERO,
                ..Default::default()
            },
        ];

        for config in invalid {
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }
    }
}
