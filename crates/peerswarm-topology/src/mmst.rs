//! Bounded-degree random topology with an XOR-distance bias.
//!
//! Every peer originates a small number of connections to peers that are
//! near it in key space, picked from a random sample of the candidates, and
//! accepts inbound connections up to a hard cap. Peers over the cap shed the
//! connections that are furthest away.
//!
//! The first run waits for a useful sample: either more than `sample_size`
//! peers are known, or `lookup_timeout` has passed since `init`. After that
//! every `update()` re-runs the algorithm.

use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::time::Instant;

use peerswarm_protocol::{
    sort_by_distance, PeerId, MMST_LOOKUP_TIMEOUT_MS, MMST_MAX_PEERS,
    MMST_ORIGINATE_CONNECTIONS, MMST_SAMPLE_SIZE, TOPOLOGY_LOOKUP_INTERVAL_SECS,
};

use crate::scheduler::{Timer, Wakeup};
use crate::{SwarmController, Topology};

/// Parameters of the MMST topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmstConfig {
    /// Connections this peer opens on its own.
    pub originate_connections: usize,
    /// Hard cap on simultaneous connections.
    pub max_peers: usize,
    /// Candidates considered per run; exceeding it triggers the first run.
    pub sample_size: usize,
    /// Maximum wait for a full sample before the first run.
    pub lookup_timeout: Duration,
}

impl Default for MmstConfig {
    fn default() -> Self {
        Self {
            originate_connections: MMST_ORIGINATE_CONNECTIONS,
            max_peers: MMST_MAX_PEERS,
            sample_size: MMST_SAMPLE_SIZE,
            lookup_timeout: Duration::from_millis(MMST_LOOKUP_TIMEOUT_MS),
        }
    }
}

#[derive(Debug)]
pub struct MmstTopology {
    config: MmstConfig,
    /// Delay of the one-off fallback lookup.
    fallback_lookup: Duration,
    initialized_at: Option<Instant>,
    sample_collected: bool,
    lookup_timer: Option<Timer>,
    sample_timer: Option<Timer>,
}

impl MmstTopology {
    pub fn new(config: MmstConfig) -> Self {
        Self {
            config,
            fallback_lookup: Duration::from_secs(TOPOLOGY_LOOKUP_INTERVAL_SECS),
            initialized_at: None,
            sample_collected: false,
            lookup_timer: None,
            sample_timer: None,
        }
    }

    pub fn config(&self) -> &MmstConfig {
        &self.config
    }

    /// Whether the algorithm has started running.
    pub fn sample_collected(&self) -> bool {
        self.sample_collected
    }

    fn sample_deadline_passed(&self) -> bool {
        self.initialized_at
            .map(|at| at.elapsed() >= self.config.lookup_timeout)
            .unwrap_or(false)
    }

    fn run_algorithm(&mut self, controller: &mut dyn SwarmController) {
        let state = controller.state();
        let own = state.own_peer_id;
        let connected_count = state.connected.len();

        if connected_count > self.config.max_peers {
            let mut furthest = state.connected;
            sort_by_distance(&mut furthest, &own);
            furthest.reverse();
            for peer in furthest.into_iter().take(connected_count - self.config.max_peers) {
                tracing::debug!(peer = %peer, "MMST: disconnecting furthest peer");
                controller.disconnect(peer);
            }
        } else if connected_count < self.config.originate_connections {
            let mut sample = state.candidates;
            sample.shuffle(&mut rand::thread_rng());
            sample.truncate(self.config.sample_size);
            sort_by_distance(&mut sample, &own);
            for peer in sample
                .into_iter()
                .take(self.config.originate_connections - connected_count)
            {
                tracing::debug!(peer = %peer, "MMST: connecting to nearest sampled peer");
                controller.connect(peer);
            }
        }
    }
}

impl Default for MmstTopology {
    fn default() -> Self {
        Self::new(MmstConfig::default())
    }
}

impl Topology for MmstTopology {
    fn init(&mut self, controller: &mut dyn SwarmController) {
        if self.initialized_at.is_some() {
            tracing::warn!("MMST topology initialized twice");
            return;
        }
        self.initialized_at = Some(Instant::now());

        let scheduler = controller.scheduler();
        self.lookup_timer = Some(scheduler.after(self.fallback_lookup, Wakeup::Lookup));
        // If the sample never fills up, run on whatever has been discovered.
        self.sample_timer = Some(scheduler.after(self.config.lookup_timeout, Wakeup::Update));
    }

    fn update(&mut self, controller: &mut dyn SwarmController) {
        if !self.sample_collected {
            let state = controller.state();
            if state.connected.len() + state.candidates.len() > self.config.sample_size {
                tracing::debug!("MMST: sample collected, running the algorithm");
            } else if self.sample_deadline_passed() {
                tracing::debug!(
                    timeout_ms = self.config.lookup_timeout.as_millis() as u64,
                    "MMST: running the algorithm after sample timeout"
                );
            } else {
                return;
            }
            self.sample_collected = true;
        }
        self.run_algorithm(controller);
    }

    fn on_offer(&mut self, _peer: &PeerId, controller: &mut dyn SwarmController) -> bool {
        controller.state().connected.len() < self.config.max_peers
    }

    fn destroy(&mut self) {
        if let Some(timer) = self.lookup_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.sample_timer.take() {
            timer.cancel();
        }
    }

    fn name(&self) -> &'static str {
        "mmst"
    }
}
