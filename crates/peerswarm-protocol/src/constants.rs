/// Length in bytes of every identity key (topic, peer, session).
pub const KEY_LENGTH: usize = 32;

/// Domain-separation prefix for topic discovery keys.
pub const DISCOVERY_KEY_CONTEXT: &[u8] = b"peerswarm/discovery";

/// JSON-RPC protocol version.
pub const JSONRPC_VERSION: &str = "2.0";

/// Timeout applied to every rendezvous RPC call.
pub const RPC_TIMEOUT_MS: u64 = 3_000;

/// Delay before a failed reconciliation pass is retried.
pub const RECONCILE_RETRY_MS: u64 = 3_000;

/// Interval of the periodic candidate refresh issued by topologies.
pub const TOPOLOGY_LOOKUP_INTERVAL_SECS: u64 = 10;

/// MMST: connections a peer originates on its own.
pub const MMST_ORIGINATE_CONNECTIONS: usize = 2;

/// MMST: upper bound on simultaneous connections.
pub const MMST_MAX_PEERS: usize = 4;

/// MMST: candidates sampled per run, and the threshold that triggers the first run.
pub const MMST_SAMPLE_SIZE: usize = 10;

/// MMST: how long to wait for a full sample before running anyway.
pub const MMST_LOOKUP_TIMEOUT_MS: u64 = 1_000;
