use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::focus::FocusManager;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoveError {
  #[error("bridge not found")]
  BridgeNotFound,
  #[error("conference not found")]
  ConferenceNotFound,
  #[error("missing parameter: {0}")]
  MissingParameter(&'static str),
  #[error("invalid parameter: {0}")]
  InvalidParameter(&'static str),
  #[error("move failed")]
  MoveFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MoveResult {
  #[serde(rename = "movedEndpoints")]
  pub moved_endpoints: usize,
  pub conferences: usize,
}

/// Decides which endpoints leave a bridge: conferences ordered by how many
/// endpoints they have on it, drained one conference at a time until the
/// quota is met.
fn plan_moves(
  mut per_conference: Vec<(String, Vec<String>)>,
  n: usize,
) -> Vec<(String, Vec<String>)> {
  per_conference.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));
  let mut remaining = n;
  let mut plan = Vec::new();
  for (conference, mut endpoints) in per_conference {
    if remaining == 0 {
      break;
    }
    endpoints.truncate(remaining);
    remaining -= endpoints.len();
    if !endpoints.is_empty() {
      plan.push((conference, endpoints));
    }
  }
  plan
}

/// Admin operations draining endpoints off a bridge. Each move goes through
/// the owning conference's re-invite path.
pub struct LoadRedistributor {
  manager: Arc<FocusManager>,
}

impl LoadRedistributor {
  pub fn new(manager: Arc<FocusManager>) -> LoadRedistributor {
    LoadRedistributor { manager }
  }

  /// Moves a single endpoint. With `expected_bridge` set, the endpoint is
  /// only moved if it is currently on that bridge.
  pub async fn move_endpoint(
    &self,
    conference_id: Option<&str>,
    endpoint_id: Option<&str>,
    expected_bridge: Option<&str>,
  ) -> Result<MoveResult, MoveError> {
    let conference_id = conference_id.ok_or(MoveError::MissingParameter("conference"))?;
    let endpoint_id = endpoint_id.ok_or(MoveError::MissingParameter("endpoint"))?;
    let room = conference_id
      .parse()
      .map_err(|_| MoveError::InvalidParameter("conference"))?;
    let conference = self
      .manager
      .get_conference(&room)
      .await
      .ok_or(MoveError::ConferenceNotFound)?;
    let moved = conference
      .move_endpoint(endpoint_id, expected_bridge)
      .await
      .map_err(|e| {
        warn!("move failed: {:?}", e);
        MoveError::MoveFailed
      })?;
    Ok(MoveResult {
      moved_endpoints: usize::from(moved),
      conferences: usize::from(moved),
    })
  }

  /// Moves `n` endpoints off a bridge, optionally restricted to one
  /// conference.
  pub async fn move_endpoints(
    &self,
    bridge_id: Option<&str>,
    conference_id: Option<&str>,
    n: usize,
  ) -> Result<MoveResult, MoveError> {
    let bridge_id = bridge_id.ok_or(MoveError::MissingParameter("bridge"))?;
    if self.manager.bridge_registry().get(bridge_id).is_none() {
      return Err(MoveError::BridgeNotFound);
    }
    let per_conference = self
      .collect_endpoints_on(bridge_id, conference_id)
      .await?;
    let plan = plan_moves(per_conference, n);
    self.execute(bridge_id, plan).await
  }

  /// Moves a fraction of the endpoints a bridge hosts.
  pub async fn move_fraction(
    &self,
    bridge_id: Option<&str>,
    fraction: Option<f64>,
  ) -> Result<MoveResult, MoveError> {
    let bridge_id = bridge_id.ok_or(MoveError::MissingParameter("bridge"))?;
    let fraction = fraction.ok_or(MoveError::MissingParameter("fraction"))?;
    if !(0.0..=1.0).contains(&fraction) {
      return Err(MoveError::InvalidParameter("fraction"));
    }
    if self.manager.bridge_registry().get(bridge_id).is_none() {
      return Err(MoveError::BridgeNotFound);
    }
    let per_conference = self.collect_endpoints_on(bridge_id, None).await?;
    let total: usize = per_conference.iter().map(|(_, endpoints)| endpoints.len()).sum();
    let n = (fraction * total as f64).round() as usize;
    let plan = plan_moves(per_conference, n);
    self.execute(bridge_id, plan).await
  }

  async fn collect_endpoints_on(
    &self,
    bridge_id: &str,
    conference_id: Option<&str>,
  ) -> Result<Vec<(String, Vec<String>)>, MoveError> {
    let conferences = match conference_id {
      Some(conference_id) => {
        let room = conference_id
          .parse()
          .map_err(|_| MoveError::InvalidParameter("conference"))?;
        let conference = self
          .manager
          .get_conference(&room)
          .await
          .ok_or(MoveError::ConferenceNotFound)?;
        vec![conference]
      },
      None => self.manager.conferences().await,
    };
    let mut per_conference = Vec::new();
    for conference in conferences {
      let endpoints = conference.endpoints_on_bridge(bridge_id).await;
      if !endpoints.is_empty() {
        per_conference.push((conference.room_jid().to_string(), endpoints));
      }
    }
    Ok(per_conference)
  }

  async fn execute(
    &self,
    bridge_id: &str,
    plan: Vec<(String, Vec<String>)>,
  ) -> Result<MoveResult, MoveError> {
    let mut moved = 0;
    let mut conferences = 0;
    for (conference_id, endpoints) in plan {
      let room = match conference_id.parse() {
        Ok(room) => room,
        Err(_) => continue,
      };
      let conference = match self.manager.get_conference(&room).await {
        Some(conference) => conference,
        None => continue,
      };
      let mut moved_here = 0;
      for endpoint_id in endpoints {
        match conference.move_endpoint(&endpoint_id, Some(bridge_id)).await {
          Ok(true) => moved_here += 1,
          Ok(false) => {},
          Err(e) => warn!(endpoint_id = endpoint_id.as_str(), "move failed: {:?}", e),
        }
      }
      if moved_here > 0 {
        conferences += 1;
        moved += moved_here;
      }
    }
    info!(bridge = bridge_id, moved, conferences, "load redistribution done");
    Ok(MoveResult {
      moved_endpoints: moved,
      conferences,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn endpoints(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}-{}", prefix, i)).collect()
  }

  #[test]
  fn drains_the_biggest_conference_first() {
    let plan = plan_moves(
      vec![
        ("c2".to_owned(), endpoints("b", 3)),
        ("c1".to_owned(), endpoints("a", 4)),
        ("c3".to_owned(), endpoints("c", 3)),
      ],
      5,
    );
    assert_eq!(plan.len(), 2);
    assert_eq!(plan[0].0, "c1");
    assert_eq!(plan[0].1.len(), 4);
    assert_eq!(plan[1].1.len(), 1);
  }

  #[test]
  fn plan_stops_at_the_quota() {
    let plan = plan_moves(vec![("c1".to_owned(), endpoints("a", 10))], 3);
    assert_eq!(plan[0].1.len(), 3);
  }

  #[test]
  fn zero_quota_plans_nothing() {
    let plan = plan_moves(vec![("c1".to_owned(), endpoints("a", 2))], 0);
    assert!(plan.is_empty());
  }

  #[test]
  fn ties_order_by_conference_id() {
    let plan = plan_moves(
      vec![
        ("c2".to_owned(), endpoints("b", 2)),
        ("c1".to_owned(), endpoints("a", 2)),
      ],
      4,
    );
    assert_eq!(plan[0].0, "c1");
    assert_eq!(plan[1].0, "c2");
  }
}
