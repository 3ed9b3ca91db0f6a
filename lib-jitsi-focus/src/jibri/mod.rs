pub mod session;

use std::{
  collections::HashMap,
  sync::{Arc, RwLock},
  time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use jitsi_xmpp_parsers::{jibri_status::JibriBreweryStatus, ns::JIBRI};
use tracing::{debug, info, warn};
use xmpp_parsers::FullJid;

use crate::xmpp::muc::{MucOccupant, MucRoomHandler};

/// Spreads back-to-back selections over the pool.
pub const SELECT_TIMEOUT: Duration = Duration::from_millis(200);

/// Keeps a failing instance out of rotation.
pub const FAILURE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct JibriState {
  jid: FullJid,
  available: bool,
  last_failed: Option<Instant>,
  last_selected: Option<Instant>,
}

/// The pool of Jibri workers advertised through their brewery MUC.
#[derive(Clone, Default)]
pub struct JibriDetector {
  inner: Arc<RwLock<HashMap<String, JibriState>>>,
}

impl JibriDetector {
  pub fn new() -> JibriDetector {
    Default::default()
  }

  pub fn has_instances(&self) -> bool {
    !self.inner.read().unwrap().is_empty()
  }

  pub fn update(&self, jid: FullJid, available: bool) {
    let id = jid.to_string();
    let mut inner = self.inner.write().unwrap();
    inner
      .entry(id.clone())
      .and_modify(|state| state.available = available)
      .or_insert_with(|| {
        info!(jibri = id.as_str(), available, "jibri registered");
        JibriState {
          jid,
          available,
          last_failed: None,
          last_selected: None,
        }
      });
  }

  pub fn remove(&self, id: &str) {
    if self.inner.write().unwrap().remove(id).is_some() {
      info!(jibri = id, "jibri removed");
    }
  }

  /// Marks an instance failed, keeping it out of selection for
  /// [`FAILURE_TIMEOUT`].
  pub fn instance_failed(&self, id: &str) {
    self.instance_failed_at(id, Instant::now());
  }

  pub(crate) fn instance_failed_at(&self, id: &str, now: Instant) {
    if let Some(state) = self.inner.write().unwrap().get_mut(id) {
      warn!(jibri = id, "jibri instance failed");
      state.last_failed = Some(now);
    }
  }

  /// Picks the instance whose last failure is the furthest in the past,
  /// skipping anything selected in the last [`SELECT_TIMEOUT`] or failed in
  /// the last [`FAILURE_TIMEOUT`].
  pub fn select(&self) -> Option<FullJid> {
    self.select_at(Instant::now())
  }

  pub(crate) fn select_at(&self, now: Instant) -> Option<FullJid> {
    let mut inner = self.inner.write().unwrap();
    let selected_id = inner
      .values()
      .filter(|state| state.available)
      .filter(|state| {
        state
          .last_selected
          .map(|selected| now.duration_since(selected) >= SELECT_TIMEOUT)
          .unwrap_or(true)
      })
      .filter(|state| {
        state
          .last_failed
          .map(|failed| now.duration_since(failed) >= FAILURE_TIMEOUT)
          .unwrap_or(true)
      })
      .min_by(|a, b| {
        // Never-failed sorts before any failure; then the oldest failure
        // first, then the jid for determinism.
        let failure_order = match (a.last_failed, b.last_failed) {
          (None, None) => std::cmp::Ordering::Equal,
          (None, Some(_)) => std::cmp::Ordering::Less,
          (Some(_), None) => std::cmp::Ordering::Greater,
          (Some(a), Some(b)) => a.cmp(&b),
        };
        failure_order.then_with(|| a.jid.to_string().cmp(&b.jid.to_string()))
      })
      .map(|state| state.jid.to_string());
    let selected_id = selected_id?;
    let state = inner.get_mut(&selected_id)?;
    state.last_selected = Some(now);
    debug!(jibri = selected_id.as_str(), "selected jibri");
    Some(state.jid.clone())
  }
}

#[async_trait]
impl MucRoomHandler for JibriDetector {
  async fn occupant_joined(&self, occupant: MucOccupant) -> Result<()> {
    self.occupant_presence_changed(occupant).await
  }

  async fn occupant_presence_changed(&self, occupant: MucOccupant) -> Result<()> {
    match occupant.payload("jibri-status", JIBRI) {
      Some(payload) => {
        let status = JibriBreweryStatus::try_from(payload.clone())?;
        self.update(occupant.occupant_jid.clone(), status.available());
      },
      None => debug!(
        jibri = %occupant.occupant_jid,
        "jibri presence without status, ignoring"
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

  fn jid(name: &str) -> FullJid {
    format!("jibribrewery@internal.example.com/{}", name)
      .parse()
      .unwrap()
  }

  #[test]
  fn selects_nothing_from_an_empty_pool() {
    let detector = JibriDetector::new();
    assert!(detector.select().is_none());
  }

  #[test]
  fn skips_busy_instances() {
    let detector = JibriDetector::new();
    detector.update(jid("j1"), false);
    assert!(detector.select().is_none());
    detector.update(jid("j1"), true);
    assert!(detector.select().is_some());
  }

  #[test]
  fn respects_failure_cooldown() {
    let detector = JibriDetector::new();
    detector.update(jid("j1"), true);
    let t0 = Instant::now();
    detector.instance_failed_at(&jid("j1").to_string(), t0);
    // Within the cooldown the instance is never handed out.
    assert!(detector.select_at(t0 + Duration::from_secs(1)).is_none());
    assert!(detector
      .select_at(t0 + FAILURE_TIMEOUT - Duration::from_secs(1))
      .is_none());
    assert!(detector.select_at(t0 + FAILURE_TIMEOUT).is_some());
  }

  #[test]
  fn select_timeout_spreads_consecutive_requests() {
    let detector = JibriDetector::new();
    detector.update(jid("j1"), true);
    detector.update(jid("j2"), true);
    let t0 = Instant::now();
    let first = detector.select_at(t0).unwrap();
    let second = detector.select_at(t0 + Duration::from_millis(10)).unwrap();
    assert_ne!(first, second);
    // Both were just selected, so nothing is eligible right now.
    assert!(detector.select_at(t0 + Duration::from_millis(20)).is_none());
    assert!(detector.select_at(t0 + SELECT_TIMEOUT).is_some());
  }

  #[test]
  fn prefers_the_oldest_failure() {
    let detector = JibriDetector::new();
    detector.update(jid("j1"), true);
    detector.update(jid("j2"), true);
    let t0 = Instant::now();
    detector.instance_failed_at(&jid("j1").to_string(), t0);
    detector.instance_failed_at(&jid("j2").to_string(), t0 + Duration::from_secs(5));
    let selected = detector.select_at(t0 + FAILURE_TIMEOUT + Duration::from_secs(6));
    assert_eq!(selected.unwrap(), jid("j1"));
  }
}
