//! Configuration intake.
//!
//! One pipeline feeds the daemon regardless of where configuration comes
//! from: a snapshot of the external configuration database, or bare
//! defaults. Environment variables override individual values on top of
//! either source. The output is a fully resolved [`JoinConfig`] handed to
//! the transport and the node registry at startup.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use memberd_core::{cluster_id_from_name, NodeAddress, MAX_CLUSTER_NAME_LEN, MAX_NODE_ID};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;

/// Uniform encoded address length: 2-byte family tag plus 16 address bytes
/// (IPv4 is padded), so mixed IPv4/IPv6 clusters keep one length.
pub const ADDRESS_LEN: usize = 18;

const AF_INET: u16 = 2;
const AF_INET6: u16 = 10;

/// Default port for the cluster transport.
pub const DEFAULT_IP_PORT: u16 = 5405;

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

/// Protocol timers, in whole seconds unless noted. Values are configurable
/// through the database snapshot; the defaults match long-standing practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RuntimeTimeouts {
    /// Listen for HELLO/NEWCLUSTER this long before claiming a new cluster.
    pub joinwait_timeout: u64,
    /// Send NEWCLUSTER for this long before forming a cluster alone.
    pub newcluster_timeout: u64,
    /// Give up on JOINACK/JOINCONF after this long and re-enter JOINWAIT.
    pub join_timeout: u64,
    /// Re-send JOINCONF to an unresponsive joiner at this interval.
    pub joinconf_timeout: u64,
    /// Maximum quiet period inside a transition before remedial action.
    pub transition_timeout: u64,
    /// Declare a node dead after this long without a HELLO.
    pub deadnode_timeout: u64,
    /// HELLO send interval.
    pub hello_timer: u64,
    /// JOINCONF retries before the joiner is abandoned.
    pub max_retries: u32,
    /// Transition restarts tolerated before the node leaves as inconsistent.
    pub transition_restarts: u32,
    /// Quorum-device poll interval, milliseconds.
    pub quorumdev_poll: u64,
    /// Milliseconds to wait for shutdown replies from subscribed clients.
    pub shutdown_timeout: u64,
}

impl Default for RuntimeTimeouts {
    fn default() -> Self {
        Self {
            joinwait_timeout: 11,
            newcluster_timeout: 16,
            join_timeout: 30,
            joinconf_timeout: 12,
            transition_timeout: 15,
            deadnode_timeout: 21,
            hello_timer: 5,
            max_retries: 3,
            transition_restarts: 32,
            quorumdev_poll: 10_000,
            shutdown_timeout: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Database snapshot
// ---------------------------------------------------------------------------

/// One configured cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default)]
    pub node_id: u32,
    #[serde(default = "default_votes")]
    pub votes: u32,
    /// Interface address, textual IP form.
    #[serde(default)]
    pub address: Option<String>,
}

fn default_votes() -> u32 {
    1
}

/// Snapshot of the cluster section of the configuration database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ClusterDatabase {
    pub name: String,
    pub config_version: u32,
    pub cluster_id: Option<u16>,
    pub expected_votes: Option<u32>,
    pub two_node: bool,
    pub nodename: Option<String>,
    pub multicast: Option<String>,
    pub ip_port: Option<u16>,
    pub key_file: Option<String>,
    pub nodes: Vec<NodeSpec>,
    pub timeouts: RuntimeTimeouts,
}

/// Where configuration comes from. The pipeline downstream is identical for
/// both variants.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    Database(ClusterDatabase),
    /// No database: everything from environment overrides and defaults.
    Defaults,
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

/// Environment-variable overrides. Each beats the database-supplied value
/// for that one parameter only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub cluster_name: Option<String>,
    pub nodename: Option<String>,
    pub expected_votes: Option<u32>,
    pub ip_port: Option<u16>,
    pub key_file: Option<String>,
    pub votes: Option<u32>,
    pub node_id: Option<u32>,
    pub multicast: Option<String>,
    pub two_node: bool,
    pub startup_pipe_fd: Option<i32>,
    pub no_config: bool,
}

impl EnvOverrides {
    /// Reads the `MEMBERD_*` variables from the process environment.
    #[must_use]
    pub fn capture() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars)
    }

    /// Parses overrides from a pre-collected map (used by tests).
    #[must_use]
    pub fn from_map(vars: &HashMap<String, String>) -> Self {
        let get = |key: &str| vars.get(key).cloned();
        let get_num = |key: &str| -> Option<u32> {
            match get(key).map(|v| v.parse::<u32>()) {
                Some(Ok(n)) => Some(n),
                Some(Err(_)) => {
                    warn!(var = key, "ignoring unparsable override");
                    None
                }
                None => None,
            }
        };

        let mut overrides = Self {
            cluster_name: get("MEMBERD_CLUSTER_NAME"),
            nodename: get("MEMBERD_NODENAME"),
            expected_votes: get_num("MEMBERD_EXPECTED_VOTES").filter(|&v| v >= 1),
            ip_port: get_num("MEMBERD_IP_PORT").and_then(|v| u16::try_from(v).ok()),
            key_file: get("MEMBERD_KEYFILE"),
            votes: get_num("MEMBERD_VOTES"),
            node_id: get_num("MEMBERD_NODEID"),
            multicast: get("MEMBERD_MCAST_ADDR"),
            two_node: vars.contains_key("MEMBERD_2NODE"),
            startup_pipe_fd: get("MEMBERD_PIPE").and_then(|v| v.parse().ok()),
            no_config: vars.contains_key("MEMBERD_NOCONFIG"),
        };

        // Two-node mode pins the vote shape.
        if overrides.two_node {
            overrides.expected_votes = Some(1);
            overrides.votes = Some(1);
        }
        overrides
    }
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Everything startup needs, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinConfig {
    pub cluster_name: String,
    pub cluster_id: u16,
    pub nodename: String,
    /// Preferred node id; 0 asks the cluster to assign one.
    pub node_id: u32,
    pub votes: u8,
    pub expected_votes: u32,
    pub two_node: bool,
    pub config_version: u32,
    pub ip_port: u16,
    pub multicast: String,
    /// Local interface addresses in encoded form.
    pub interfaces: Vec<NodeAddress>,
    /// Symmetric key handed to the transport.
    pub key: Vec<u8>,
    pub nodes: Vec<NodeSpec>,
    pub timeouts: RuntimeTimeouts,
}

/// Encodes a textual IP into the uniform family-tagged address form.
///
/// # Errors
///
/// `ConfigError::LocalhostAddress` for loopback addresses; invalid text is
/// reported as a family mismatch by the caller.
pub fn encode_address(text: &str) -> Result<NodeAddress, ConfigError> {
    let ip: IpAddr = text
        .parse()
        .map_err(|_| ConfigError::UnknownNodeName(text.to_string()))?;
    if ip.is_loopback() {
        return Err(ConfigError::LocalhostAddress);
    }
    let mut bytes = Vec::with_capacity(ADDRESS_LEN);
    match ip {
        IpAddr::V4(v4) => {
            bytes.extend_from_slice(&AF_INET.to_le_bytes());
            bytes.extend_from_slice(&v4.octets());
            bytes.resize(ADDRESS_LEN, 0);
        }
        IpAddr::V6(v6) => {
            bytes.extend_from_slice(&AF_INET6.to_le_bytes());
            bytes.extend_from_slice(&v6.octets());
        }
    }
    Ok(NodeAddress::new(bytes))
}

/// Address family of a textual IP, for multicast/interface agreement checks.
fn family_of(text: &str) -> Option<u16> {
    text.parse::<IpAddr>().ok().map(|ip| match ip {
        IpAddr::V4(_) => AF_INET,
        IpAddr::V6(_) => AF_INET6,
    })
}

/// Default multicast address derived from the cluster id:
/// `239.192.hi.lo` for IPv4 clusters, `ff15::<id>` for IPv6.
#[must_use]
pub fn default_multicast(family_v6: bool, cluster_id: u16) -> String {
    if family_v6 {
        format!("ff15::{cluster_id:x}")
    } else {
        format!("239.192.{}.{}", cluster_id >> 8, cluster_id & 0xFF)
    }
}

/// Matches the local nodename against the configured node list: exact name
/// first, then the domain-less short form on either side, then any local
/// interface address.
///
/// # Errors
///
/// `ConfigError::UnknownNodeName` when nothing matches.
pub fn verify_nodename<'a>(
    nodename: &str,
    nodes: &'a [NodeSpec],
    local_addresses: &[String],
) -> Result<&'a NodeSpec, ConfigError> {
    if let Some(node) = nodes.iter().find(|n| n.name == nodename) {
        return Ok(node);
    }

    let short = nodename.split('.').next().unwrap_or(nodename);
    if let Some(node) = nodes
        .iter()
        .find(|n| n.name.split('.').next().unwrap_or(&n.name) == short)
    {
        return Ok(node);
    }

    for addr in local_addresses {
        if let Some(node) = nodes.iter().find(|n| n.address.as_deref() == Some(addr)) {
            return Ok(node);
        }
    }

    Err(ConfigError::UnknownNodeName(nodename.to_string()))
}

/// Loads the transport key: the key file when one is configured, otherwise
/// the cluster name zero-padded up to a multiple of four bytes. The padded
/// name isolates differently-named clusters sharing one network segment.
///
/// # Errors
///
/// `ConfigError::KeyFile` when the configured file cannot be read.
pub fn key_material(key_file: Option<&str>, cluster_name: &str) -> Result<Vec<u8>, ConfigError> {
    if let Some(path) = key_file {
        return std::fs::read(Path::new(path)).map_err(|source| ConfigError::KeyFile {
            path: path.to_string(),
            source,
        });
    }
    let mut key = cluster_name.as_bytes().to_vec();
    let padded = (key.len() + 4) & !3;
    key.resize(padded, 0);
    Ok(key)
}

/// Resolves the full startup configuration.
///
/// # Errors
///
/// Any [`ConfigError`]; all of them abort startup.
pub fn resolve(
    source: &ConfigSource,
    env: &EnvOverrides,
    local_hostname: &str,
) -> Result<JoinConfig, ConfigError> {
    let db = match source {
        ConfigSource::Database(db) => db.clone(),
        ConfigSource::Defaults => ClusterDatabase::default(),
    };

    let cluster_name = env
        .cluster_name
        .clone()
        .unwrap_or_else(|| db.name.clone());
    if cluster_name.len() > MAX_CLUSTER_NAME_LEN {
        return Err(ConfigError::ClusterNameTooLong(cluster_name));
    }

    let cluster_id = db
        .cluster_id
        .unwrap_or_else(|| cluster_id_from_name(&cluster_name));

    let nodename = env
        .nodename
        .clone()
        .or_else(|| db.nodename.clone())
        .unwrap_or_else(|| local_hostname.to_string());

    // Identify ourselves in the node list; with no configured nodes (the
    // Defaults source) everything must come from the environment.
    let our_spec = if db.nodes.is_empty() {
        None
    } else {
        let local: Vec<String> = db
            .nodes
            .iter()
            .filter_map(|n| n.address.clone())
            .collect();
        Some(verify_nodename(&nodename, &db.nodes, &local)?.clone())
    };

    let node_id = env
        .node_id
        .or(our_spec.as_ref().map(|s| s.node_id))
        .unwrap_or(0);
    if node_id > MAX_NODE_ID {
        return Err(ConfigError::NodeIdOutOfRange(node_id));
    }
    if our_spec.is_some() && node_id == 0 {
        return Err(ConfigError::MissingNodeId(nodename.clone()));
    }

    let votes = env
        .votes
        .or(our_spec.as_ref().map(|s| s.votes))
        .unwrap_or(1);
    if votes == 0 || votes > 255 {
        return Err(ConfigError::BadVotes(nodename.clone()));
    }

    // Expected votes: override, else explicit setting, else vote sum.
    let vote_sum: u32 = db.nodes.iter().map(|n| n.votes).sum();
    let expected_votes = env
        .expected_votes
        .or(db.expected_votes)
        .unwrap_or(if vote_sum > 0 { vote_sum } else { 1 });

    let two_node = env.two_node || db.two_node;
    if two_node && !db.nodes.is_empty() {
        if db.nodes.len() != 2 || vote_sum != 2 {
            return Err(ConfigError::TwoNodeShape {
                nodes: db.nodes.len(),
                votes: vote_sum,
            });
        }
        if votes != 1 {
            return Err(ConfigError::TwoNodeShape {
                nodes: db.nodes.len(),
                votes,
            });
        }
    }

    // Interface addresses come from our node entry; the daemon can add more
    // through the pre-join client commands.
    let mut interfaces = Vec::new();
    if let Some(spec) = &our_spec {
        if let Some(text) = &spec.address {
            interfaces.push(encode_address(text)?);
        }
    }

    let multicast = env
        .multicast
        .clone()
        .or_else(|| db.multicast.clone())
        .unwrap_or_else(|| {
            let v6 = our_spec
                .as_ref()
                .and_then(|s| s.address.as_deref())
                .and_then(family_of)
                == Some(AF_INET6);
            default_multicast(v6, cluster_id)
        });

    // Interface and multicast families must agree.
    if let Some(mcast_family) = family_of(&multicast) {
        for spec in &db.nodes {
            if let Some(text) = &spec.address {
                if family_of(text).is_some_and(|f| f != mcast_family) {
                    return Err(ConfigError::FamilyMismatch);
                }
            }
        }
    }

    let key_file = env.key_file.clone().or_else(|| db.key_file.clone());
    let key = key_material(key_file.as_deref(), &cluster_name)?;

    let ip_port = env.ip_port.or(db.ip_port).unwrap_or(DEFAULT_IP_PORT);

    info!(
        cluster = %cluster_name,
        cluster_id,
        node = %nodename,
        node_id,
        votes,
        expected_votes,
        two_node,
        "configuration resolved"
    );

    Ok(JoinConfig {
        cluster_name,
        cluster_id,
        nodename,
        node_id,
        votes: votes as u8,
        expected_votes,
        two_node,
        config_version: db.config_version,
        ip_port,
        multicast,
        interfaces,
        key,
        nodes: db.nodes,
        timeouts: db.timeouts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_node_db() -> ClusterDatabase {
        ClusterDatabase {
            name: "alpha".into(),
            config_version: 1,
            nodes: vec![
                NodeSpec {
                    name: "node-a.example.net".into(),
                    node_id: 1,
                    votes: 1,
                    address: Some("10.0.0.1".into()),
                },
                NodeSpec {
                    name: "node-b.example.net".into(),
                    node_id: 2,
                    votes: 1,
                    address: Some("10.0.0.2".into()),
                },
                NodeSpec {
                    name: "node-c.example.net".into(),
                    node_id: 3,
                    votes: 1,
                    address: Some("10.0.0.3".into()),
                },
            ],
            ..ClusterDatabase::default()
        }
    }

    #[test]
    fn resolves_three_node_cluster() {
        let cfg = resolve(
            &ConfigSource::Database(three_node_db()),
            &EnvOverrides::default(),
            "node-b.example.net",
        )
        .unwrap();

        assert_eq!(cfg.node_id, 2);
        assert_eq!(cfg.votes, 1);
        assert_eq!(cfg.expected_votes, 3);
        assert_eq!(cfg.cluster_id, cluster_id_from_name("alpha"));
        assert_eq!(cfg.interfaces.len(), 1);
    }

    #[test]
    fn short_hostname_matches_fqdn_entry() {
        let cfg = resolve(
            &ConfigSource::Database(three_node_db()),
            &EnvOverrides::default(),
            "node-c",
        )
        .unwrap();
        assert_eq!(cfg.node_id, 3);
    }

    #[test]
    fn unknown_hostname_rejected() {
        let err = resolve(
            &ConfigSource::Database(three_node_db()),
            &EnvOverrides::default(),
            "stranger",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownNodeName(_)));
    }

    #[test]
    fn env_overrides_beat_database() {
        let vars = HashMap::from([
            ("MEMBERD_EXPECTED_VOTES".to_string(), "5".to_string()),
            ("MEMBERD_NODEID".to_string(), "7".to_string()),
        ]);
        let cfg = resolve(
            &ConfigSource::Database(three_node_db()),
            &EnvOverrides::from_map(&vars),
            "node-a.example.net",
        )
        .unwrap();
        assert_eq!(cfg.expected_votes, 5);
        assert_eq!(cfg.node_id, 7);
    }

    #[test]
    fn two_node_env_pins_votes() {
        let vars = HashMap::from([("MEMBERD_2NODE".to_string(), String::new())]);
        let env = EnvOverrides::from_map(&vars);
        assert!(env.two_node);
        assert_eq!(env.expected_votes, Some(1));
        assert_eq!(env.votes, Some(1));
    }

    #[test]
    fn two_node_demands_exactly_two_nodes() {
        let mut db = three_node_db();
        db.two_node = true;
        let err = resolve(
            &ConfigSource::Database(db),
            &EnvOverrides::default(),
            "node-a.example.net",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::TwoNodeShape { nodes: 3, .. }));
    }

    #[test]
    fn default_multicast_from_cluster_id() {
        assert_eq!(default_multicast(false, 0x1234), "239.192.18.52");
        assert_eq!(default_multicast(true, 0x1234), "ff15::1234");
    }

    #[test]
    fn localhost_interface_rejected() {
        assert!(matches!(
            encode_address("127.0.0.1"),
            Err(ConfigError::LocalhostAddress)
        ));
    }

    #[test]
    fn encoded_addresses_have_uniform_length() {
        let v4 = encode_address("10.0.0.1").unwrap();
        let v6 = encode_address("fd00::1").unwrap();
        assert_eq!(v4.len(), ADDRESS_LEN);
        assert_eq!(v6.len(), ADDRESS_LEN);
        assert_eq!(v4.family(), AF_INET);
        assert_eq!(v6.family(), AF_INET6);
    }

    #[test]
    fn family_mismatch_detected() {
        let mut db = three_node_db();
        db.multicast = Some("ff15::99".into());
        let err = resolve(
            &ConfigSource::Database(db),
            &EnvOverrides::default(),
            "node-a.example.net",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::FamilyMismatch));
    }

    #[test]
    fn key_defaults_to_padded_cluster_name() {
        let key = key_material(None, "alpha").unwrap();
        assert_eq!(key.len() % 4, 0);
        assert!(key.len() >= 5);
        assert_eq!(&key[..5], b"alpha");
    }

    #[test]
    fn defaults_source_needs_only_env() {
        let vars = HashMap::from([
            ("MEMBERD_CLUSTER_NAME".to_string(), "solo".to_string()),
            ("MEMBERD_NODEID".to_string(), "1".to_string()),
        ]);
        let cfg = resolve(
            &ConfigSource::Defaults,
            &EnvOverrides::from_map(&vars),
            "lonely-host",
        )
        .unwrap();
        assert_eq!(cfg.cluster_name, "solo");
        assert_eq!(cfg.node_id, 1);
        assert_eq!(cfg.expected_votes, 1);
    }

    #[test]
    fn timeout_defaults() {
        let t = RuntimeTimeouts::default();
        assert_eq!(t.hello_timer, 5);
        assert!(t.deadnode_timeout > t.hello_timer);
        assert_eq!(t.transition_restarts, 32);
    }
}
