pub mod cascade;
pub mod selector;

use std::{
  collections::{HashMap, VecDeque},
  sync::{Arc, RwLock},
  time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use jitsi_xmpp_parsers::{colibri_stats::BridgeStats, ns::JITSI_COLIBRI};
use tracing::{debug, info, warn};
use xmpp_parsers::FullJid;

use crate::{
  config::FocusConfig,
  xmpp::muc::{MucOccupant, MucRoomHandler},
};

/// One media bridge, as advertised through its brewery MUC presence.
#[derive(Debug, Clone)]
pub struct Bridge {
  /// The bridge's occupant jid in the brewery.
  pub jid: FullJid,
  pub relay_id: Option<String>,
  pub region: Option<String>,
  pub version: Option<String>,

  /// Advertised load, in [0, 1].
  pub stress: f64,

  pub operational: bool,
  pub drain: bool,
  pub graceful_shutdown: bool,
}

impl Bridge {
  pub fn id(&self) -> String {
    self.jid.to_string()
  }
}

/// A point-in-time view of one bridge, with the load correction applied.
#[derive(Debug, Clone)]
pub struct BridgeSnapshot {
  pub bridge: Bridge,
  /// Advertised stress plus a charge for endpoints we allocated recently,
  /// which the bridge's own report does not reflect yet.
  pub corrected_stress: f64,
  pub in_failure_cooldown: bool,
}

impl BridgeSnapshot {
  pub fn id(&self) -> String {
    self.bridge.id()
  }

  /// Whether this bridge may take new endpoints.
  pub fn usable(&self, version_pin: Option<&str>) -> bool {
    self.bridge.operational
      && !self.bridge.drain
      && !self.bridge.graceful_shutdown
      && !self.in_failure_cooldown
      && self.corrected_stress < 1.0
      && version_pin
        .map(|pin| self.bridge.version.as_deref() == Some(pin))
        .unwrap_or(true)
  }
}

struct BridgeState {
  bridge: Bridge,
  last_failure: Option<Instant>,
  recent_endpoints: VecDeque<Instant>,
}

/// All bridges known to this focus. Written to from brewery presence,
/// read (as snapshots) by selection.
#[derive(Clone)]
pub struct BridgeRegistry {
  inner: Arc<RwLock<HashMap<String, BridgeState>>>,
  rampup_interval: Duration,
  stress_per_new_endpoint: f64,
  failure_cooldown: Duration,
}

impl BridgeRegistry {
  pub fn new(config: &FocusConfig) -> BridgeRegistry {
    BridgeRegistry {
      inner: Arc::new(RwLock::new(HashMap::new())),
      rampup_interval: config.participant_rampup_interval,
      stress_per_new_endpoint: config.stress_per_new_endpoint,
      failure_cooldown: config.bridge_failure_cooldown,
    }
  }

  pub fn update(&self, jid: FullJid, stats: &BridgeStats) {
    let id = jid.to_string();
    let mut inner = self.inner.write().unwrap();
    let state = inner.entry(id.clone()).or_insert_with(|| {
      info!(bridge = id.as_str(), "bridge registered");
      BridgeState {
        bridge: Bridge {
          jid: jid.clone(),
          relay_id: None,
          region: None,
          version: None,
          stress: 0.0,
          operational: true,
          drain: false,
          graceful_shutdown: false,
        },
        last_failure: None,
        recent_endpoints: VecDeque::new(),
      }
    });
    let bridge = &mut state.bridge;
    bridge.relay_id = stats.relay_id().map(ToOwned::to_owned);
    bridge.region = stats.region().map(ToOwned::to_owned);
    bridge.version = stats.version().map(ToOwned::to_owned);
    bridge.stress = stats.stress_level().unwrap_or(bridge.stress);
    let was_operational = bridge.operational;
    bridge.operational = stats.healthy();
    bridge.drain = stats.drain();
    bridge.graceful_shutdown = stats.graceful_shutdown();
    if was_operational && !bridge.operational {
      warn!(bridge = id.as_str(), "bridge became non-operational");
    }
  }

  pub fn remove(&self, id: &str) {
    if self.inner.write().unwrap().remove(id).is_some() {
      info!(bridge = id, "bridge removed");
    }
  }

  /// Puts the bridge into the selection cooldown.
  pub fn mark_failed(&self, id: &str) {
    self.mark_failed_at(id, Instant::now());
  }

  pub(crate) fn mark_failed_at(&self, id: &str, now: Instant) {
    if let Some(state) = self.inner.write().unwrap().get_mut(id) {
      warn!(bridge = id, "bridge marked failed");
      state.last_failure = Some(now);
    }
  }

  /// Clears the failure cooldown, after the bridge answered us again.
  pub fn clear_failure(&self, id: &str) {
    if let Some(state) = self.inner.write().unwrap().get_mut(id) {
      state.last_failure = None;
    }
  }

  /// Charges the bridge for a fresh allocation, so that back-to-back
  /// selections do not stampede onto the least-loaded bridge.
  pub fn endpoint_added(&self, id: &str) {
    self.endpoint_added_at(id, Instant::now());
  }

  pub(crate) fn endpoint_added_at(&self, id: &str, now: Instant) {
    if let Some(state) = self.inner.write().unwrap().get_mut(id) {
      state.recent_endpoints.push_back(now);
    }
  }

  pub fn snapshot(&self) -> Vec<BridgeSnapshot> {
    self.snapshot_at(Instant::now())
  }

  pub(crate) fn snapshot_at(&self, now: Instant) -> Vec<BridgeSnapshot> {
    let mut inner = self.inner.write().unwrap();
    inner
      .values_mut()
      .map(|state| {
        while let Some(first) = state.recent_endpoints.front() {
          if now.duration_since(*first) > self.rampup_interval {
            state.recent_endpoints.pop_front();
          }
          else {
            break;
          }
        }
        BridgeSnapshot {
          corrected_stress: state.bridge.stress
            + self.stress_per_new_endpoint * state.recent_endpoints.len() as f64,
          in_failure_cooldown: state
            .last_failure
            .map(|failed| now.duration_since(failed) < self.failure_cooldown)
            .unwrap_or_default(),
          bridge: state.bridge.clone(),
        }
      })
      .collect()
  }

  pub fn get(&self, id: &str) -> Option<Bridge> {
    self
      .inner
      .read()
      .unwrap()
      .get(id)
      .map(|state| state.bridge.clone())
  }

  pub fn operational_count(&self) -> usize {
    self
      .inner
      .read()
      .unwrap()
      .values()
      .filter(|state| state.bridge.operational)
      .count()
  }
}

#[async_trait]
impl MucRoomHandler for BridgeRegistry {
  async fn occupant_joined(&self, occupant: MucOccupant) -> Result<()> {
    self.occupant_presence_changed(occupant).await
  }

  async fn occupant_presence_changed(&self, occupant: MucOccupant) -> Result<()> {
    match occupant.payload("stats", JITSI_COLIBRI) {
      Some(payload) => {
        let stats = BridgeStats::try_from(payload.clone())?;
        self.update(occupant.occupant_jid.clone(), &stats);
      },
      None => debug!(
        bridge = %occupant.occupant_jid,
        "bridge presence without stats, ignoring"
      ),
    }
    Ok(())
  }

  async fn occupant_left(&self, occupant: MucOccupant) -> Result<()> {
    self.remove(&occupant.occupant_jid.to_string());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn stats(stress: f64) -> BridgeStats {
    BridgeStats::new()
      .with_stat("stress-level", stress)
      .with_stat("region", "eu-west")
      .with_stat("version", "2.3")
      .with_stat("relay-id", "relay-1")
  }

  fn jid(name: &str) -> FullJid {
    format!("brewery@internal.example.com/{}", name).parse().unwrap()
  }

  fn config() -> FocusConfig {
    FocusConfig::default()
  }

  #[test]
  fn corrected_stress_charges_recent_endpoints() {
    let registry = BridgeRegistry::new(&config());
    registry.update(jid("b1"), &stats(0.1));
    let id = jid("b1").to_string();
    let t0 = Instant::now();
    registry.endpoint_added_at(&id, t0);
    registry.endpoint_added_at(&id, t0);
    let snapshot = &registry.snapshot_at(t0)[0];
    assert!((snapshot.corrected_stress - 0.14).abs() < 1e-9);
    // The charge decays once the rampup interval has passed.
    let later = t0 + config().participant_rampup_interval + Duration::from_secs(1);
    let snapshot = &registry.snapshot_at(later)[0];
    assert!((snapshot.corrected_stress - 0.1).abs() < 1e-9);
  }

  #[test]
  fn failure_cooldown_expires() {
    let registry = BridgeRegistry::new(&config());
    registry.update(jid("b1"), &stats(0.1));
    let id = jid("b1").to_string();
    let t0 = Instant::now();
    registry.mark_failed_at(&id, t0);
    assert!(registry.snapshot_at(t0)[0].in_failure_cooldown);
    let later = t0 + config().bridge_failure_cooldown + Duration::from_secs(1);
    assert!(!registry.snapshot_at(later)[0].in_failure_cooldown);
    registry.mark_failed_at(&id, later);
    registry.clear_failure(&id);
    assert!(!registry.snapshot_at(later)[0].in_failure_cooldown);
  }

  #[test]
  fn draining_bridge_is_not_usable() {
    let registry = BridgeRegistry::new(&config());
    registry.update(jid("b1"), &stats(0.1).with_stat("drain", true));
    let snapshot = &registry.snapshot()[0];
    assert!(!snapshot.usable(None));
  }

  #[test]
  fn version_pin_filters() {
    let registry = BridgeRegistry::new(&config());
    registry.update(jid("b1"), &stats(0.1));
    let snapshot = &registry.snapshot()[0];
    assert!(snapshot.usable(Some("2.3")));
    assert!(!snapshot.usable(Some("2.4")));
  }
}
