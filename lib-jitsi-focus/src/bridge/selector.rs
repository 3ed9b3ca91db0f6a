use std::{cmp::Ordering, collections::HashMap, str::FromStr};

use tracing::{debug, warn};

use crate::bridge::{Bridge, BridgeRegistry, BridgeSnapshot};

/// How bridges are picked for new endpoints. Chosen by configuration when a
/// conference is created; immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
  /// Keep the whole conference on one bridge for as long as it works.
  SingleBridge,

  /// Always prefer a bridge the conference is not using yet. For testing
  /// cascades.
  SplitBridge,

  /// Put each participant on a bridge in its own region where possible.
  RegionBased,

  /// As RegionBased, but willing to grow the cascade into a new region
  /// rather than reuse an out-of-region conference bridge.
  RegionBasedWithCascade,
}

impl FromStr for SelectionStrategy {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> anyhow::Result<SelectionStrategy> {
    match s {
      "single-bridge" => Ok(SelectionStrategy::SingleBridge),
      "split-bridge" => Ok(SelectionStrategy::SplitBridge),
      "region-based" => Ok(SelectionStrategy::RegionBased),
      "region-based-with-cascade" => Ok(SelectionStrategy::RegionBasedWithCascade),
      other => Err(anyhow::anyhow!("unknown selection strategy: {}", other)),
    }
  }
}

/// Applies the configured strategy over the current bridge snapshots.
#[derive(Clone)]
pub struct BridgeSelector {
  registry: BridgeRegistry,
  strategy: SelectionStrategy,
}

impl BridgeSelector {
  pub fn new(registry: BridgeRegistry, strategy: SelectionStrategy) -> BridgeSelector {
    BridgeSelector { registry, strategy }
  }

  pub fn registry(&self) -> &BridgeRegistry {
    &self.registry
  }

  /// Picks a bridge for one endpoint, or `None` when no bridge is usable
  /// (the conference then fails with resource-constraint).
  pub fn select(
    &self,
    conference_bridges: &HashMap<String, usize>,
    participant_region: Option<&str>,
    version_pin: Option<&str>,
  ) -> Option<Bridge> {
    let snapshots = self.registry.snapshot();
    let selected = select_from(
      &snapshots,
      self.strategy,
      conference_bridges,
      participant_region,
      version_pin,
    );
    match &selected {
      Some(bridge) => debug!(
        bridge = %bridge.jid,
        region = ?bridge.region,
        strategy = ?self.strategy,
        "selected bridge"
      ),
      None => warn!(
        strategy = ?self.strategy,
        participant_region,
        "no usable bridge"
      ),
    }
    selected
  }
}

fn least_loaded<'a>(
  candidates: impl Iterator<Item = &'a BridgeSnapshot>,
) -> Option<&'a BridgeSnapshot> {
  candidates.min_by(|a, b| {
    a.corrected_stress
      .partial_cmp(&b.corrected_stress)
      .unwrap_or(Ordering::Equal)
      .then_with(|| a.id().cmp(&b.id()))
  })
}

pub(crate) fn select_from(
  snapshots: &[BridgeSnapshot],
  strategy: SelectionStrategy,
  conference_bridges: &HashMap<String, usize>,
  participant_region: Option<&str>,
  version_pin: Option<&str>,
) -> Option<Bridge> {
  let usable: Vec<&BridgeSnapshot> = snapshots
    .iter()
    .filter(|snapshot| snapshot.usable(version_pin))
    .collect();
  if usable.is_empty() {
    return None;
  }
  let in_conference =
    |snapshot: &&BridgeSnapshot| conference_bridges.contains_key(&snapshot.id());
  let in_region = |snapshot: &&BridgeSnapshot| {
    participant_region.is_some() && snapshot.bridge.region.as_deref() == participant_region
  };

  let selected = match strategy {
    SelectionStrategy::SingleBridge => {
      if conference_bridges.len() == 1 {
        let existing = usable.iter().copied().find(in_conference);
        if existing.is_some() {
          existing
        }
        else {
          least_loaded(usable.iter().copied().filter(in_region))
            .or_else(|| least_loaded(usable.iter().copied()))
        }
      }
      else {
        least_loaded(usable.iter().copied().filter(in_region))
          .or_else(|| least_loaded(usable.iter().copied()))
      }
    },
    SelectionStrategy::SplitBridge => least_loaded(
      usable
        .iter()
        .copied()
        .filter(|snapshot| !in_conference(snapshot)),
    )
    .or_else(|| least_loaded(usable.iter().copied())),
    SelectionStrategy::RegionBased => {
      least_loaded(
        usable
          .iter()
          .copied()
          .filter(|snapshot| in_conference(snapshot) && in_region(snapshot)),
      )
      .or_else(|| least_loaded(usable.iter().copied().filter(in_conference)))
      .or_else(|| least_loaded(usable.iter().copied().filter(in_region)))
      .or_else(|| least_loaded(usable.iter().copied()))
    },
    SelectionStrategy::RegionBasedWithCascade => {
      least_loaded(
        usable
          .iter()
          .copied()
          .filter(|snapshot| in_conference(snapshot) && in_region(snapshot)),
      )
      .or_else(|| least_loaded(usable.iter().copied().filter(in_region)))
      .or_else(|| least_loaded(usable.iter().copied().filter(in_conference)))
      .or_else(|| least_loaded(usable.iter().copied()))
    },
  };
  selected.map(|snapshot| snapshot.bridge.clone())
}

#[cfg(test)]
mod tests {
  use super::*;
  use maplit::hashmap;
  use xmpp_parsers::FullJid;

  fn snapshot(name: &str, region: Option<&str>, stress: f64) -> BridgeSnapshot {
    let jid: FullJid = format!("brewery@internal.example.com/{}", name)
      .parse()
      .unwrap();
    BridgeSnapshot {
      bridge: Bridge {
        jid,
        relay_id: Some(name.to_owned()),
        region: region.map(ToOwned::to_owned),
        version: Some("2.3".to_owned()),
        stress,
        operational: true,
        drain: false,
        graceful_shutdown: false,
      },
      corrected_stress: stress,
      in_failure_cooldown: false,
    }
  }

  fn id(name: &str) -> String {
    format!("brewery@internal.example.com/{}", name)
  }

  fn no_bridges() -> HashMap<String, usize> {
    HashMap::new()
  }

  #[test]
  fn returns_none_when_nothing_usable() {
    let mut overloaded = snapshot("b1", None, 1.2);
    overloaded.corrected_stress = 1.2;
    assert!(select_from(
      &[overloaded],
      SelectionStrategy::RegionBased,
      &no_bridges(),
      None,
      None,
    )
    .is_none());
  }

  #[test]
  fn excludes_bridges_in_cooldown() {
    let mut failed = snapshot("b1", None, 0.1);
    failed.in_failure_cooldown = true;
    let ok = snapshot("b2", None, 0.9);
    let selected = select_from(
      &[failed, ok],
      SelectionStrategy::RegionBased,
      &no_bridges(),
      None,
      None,
    )
    .unwrap();
    assert_eq!(selected.id(), id("b2"));
  }

  #[test]
  fn single_bridge_sticks_to_the_conference_bridge() {
    let snapshots = [snapshot("b1", None, 0.8), snapshot("b2", None, 0.1)];
    let conference = hashmap! { id("b1") => 3 };
    let selected = select_from(
      &snapshots,
      SelectionStrategy::SingleBridge,
      &conference,
      None,
      None,
    )
    .unwrap();
    assert_eq!(selected.id(), id("b1"));
  }

  #[test]
  fn split_bridge_prefers_a_fresh_bridge() {
    let snapshots = [snapshot("b1", None, 0.1), snapshot("b2", None, 0.8)];
    let conference = hashmap! { id("b1") => 1 };
    let selected = select_from(
      &snapshots,
      SelectionStrategy::SplitBridge,
      &conference,
      None,
      None,
    )
    .unwrap();
    assert_eq!(selected.id(), id("b2"));
  }

  #[test]
  fn region_based_prefers_conference_bridge_in_region() {
    let snapshots = [
      snapshot("b1", Some("us-east"), 0.5),
      snapshot("b2", Some("eu-west"), 0.1),
      snapshot("b3", Some("us-east"), 0.05),
    ];
    let conference = hashmap! { id("b1") => 2 };
    let selected = select_from(
      &snapshots,
      SelectionStrategy::RegionBased,
      &conference,
      Some("us-east"),
      None,
    )
    .unwrap();
    assert_eq!(selected.id(), id("b1"));
  }

  #[test]
  fn region_based_with_cascade_grows_into_the_region() {
    let snapshots = [
      snapshot("b1", Some("us-east"), 0.5),
      snapshot("b2", Some("eu-west"), 0.1),
    ];
    let conference = hashmap! { id("b1") => 2 };
    let selected = select_from(
      &snapshots,
      SelectionStrategy::RegionBasedWithCascade,
      &conference,
      Some("eu-west"),
      None,
    )
    .unwrap();
    assert_eq!(selected.id(), id("b2"));
  }

  #[test]
  fn without_region_falls_back_to_least_loaded() {
    let snapshots = [snapshot("b1", None, 0.3), snapshot("b2", None, 0.2)];
    let selected = select_from(
      &snapshots,
      SelectionStrategy::RegionBased,
      &no_bridges(),
      None,
      None,
    )
    .unwrap();
    assert_eq!(selected.id(), id("b2"));
  }

  #[test]
  fn ties_break_on_bridge_id() {
    let snapshots = [snapshot("b2", None, 0.2), snapshot("b1", None, 0.2)];
    let selected = select_from(
      &snapshots,
      SelectionStrategy::RegionBased,
      &no_bridges(),
      None,
      None,
    )
    .unwrap();
    assert_eq!(selected.id(), id("b1"));
  }

  #[test]
  fn version_pin_excludes_other_versions() {
    let mut other = snapshot("b1", None, 0.1);
    other.bridge.version = Some("2.4".to_owned());
    let pinned = snapshot("b2", None, 0.9);
    let selected = select_from(
      &[other, pinned],
      SelectionStrategy::RegionBased,
      &no_bridges(),
      None,
      Some("2.3"),
    )
    .unwrap();
    assert_eq!(selected.id(), id("b2"));
  }
}
