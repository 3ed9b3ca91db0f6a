use std::collections::{BTreeMap, BTreeSet, VecDeque};

use thiserror::Error;
use tracing::debug;

/// A link from one cascade node to another. Links always come in symmetric
/// pairs carrying the same mesh id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeLink {
  /// The relay id of the peer node.
  pub relay_id: String,

  /// The mesh this link belongs to.
  pub mesh_id: String,
}

/// A node in a cascade: one bridge participating in a conference.
pub trait CascadeNode {
  fn relay_id(&self) -> &str;
  fn links(&self) -> &BTreeMap<String, CascadeLink>;
  fn links_mut(&mut self) -> &mut BTreeMap<String, CascadeLink>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CascadeError {
  #[error("node already in cascade: {0}")]
  NodeExists(String),
  #[error("no such node in cascade: {0}")]
  UnknownNode(String),
  #[error("no such mesh in cascade: {0}")]
  UnknownMesh(String),
  #[error("mesh id already in use: {0}")]
  MeshExists(String),
  #[error("a node must not link to itself")]
  SelfLink,
  #[error("link from {0} to {1} is not symmetric")]
  AsymmetricLink(String, String),
  #[error("mesh {0} is not fully connected")]
  MeshIncomplete(String),
  #[error("cascade is not connected")]
  Disconnected,
  #[error("cascade has more than one path between some nodes")]
  DuplicatePaths,
}

/// A tree of meshes: within a mesh every pair of nodes is directly linked,
/// and between meshes there is exactly one path. This keeps inter-bridge
/// forwarding loop-free while bounding relay fanout.
#[derive(Debug)]
pub struct Cascade<N> {
  nodes: BTreeMap<String, N>,
}

impl<N> Default for Cascade<N> {
  fn default() -> Cascade<N> {
    Cascade {
      nodes: BTreeMap::new(),
    }
  }
}

impl<N: CascadeNode> Cascade<N> {
  pub fn new() -> Cascade<N> {
    Default::default()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn contains(&self, relay_id: &str) -> bool {
    self.nodes.contains_key(relay_id)
  }

  pub fn get(&self, relay_id: &str) -> Option<&N> {
    self.nodes.get(relay_id)
  }

  pub fn get_mut(&mut self, relay_id: &str) -> Option<&mut N> {
    self.nodes.get_mut(relay_id)
  }

  pub fn nodes(&self) -> impl Iterator<Item = &N> {
    self.nodes.values()
  }

  pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut N> {
    self.nodes.values_mut()
  }

  pub fn relay_ids(&self) -> impl Iterator<Item = &str> {
    self.nodes.keys().map(String::as_str)
  }

  /// The nodes currently participating in `mesh_id`.
  pub fn mesh_members(&self, mesh_id: &str) -> BTreeSet<String> {
    let mut members = BTreeSet::new();
    for (relay_id, node) in &self.nodes {
      for link in node.links().values() {
        if link.mesh_id == mesh_id {
          members.insert(relay_id.clone());
          members.insert(link.relay_id.clone());
        }
      }
    }
    members
  }

  fn link(&mut self, a: &str, b: &str, mesh_id: &str) -> Result<(), CascadeError> {
    if a == b {
      return Err(CascadeError::SelfLink);
    }
    if !self.nodes.contains_key(a) {
      return Err(CascadeError::UnknownNode(a.to_owned()));
    }
    if !self.nodes.contains_key(b) {
      return Err(CascadeError::UnknownNode(b.to_owned()));
    }
    self.nodes.get_mut(a).unwrap().links_mut().insert(
      b.to_owned(),
      CascadeLink {
        relay_id: b.to_owned(),
        mesh_id: mesh_id.to_owned(),
      },
    );
    self.nodes.get_mut(b).unwrap().links_mut().insert(
      a.to_owned(),
      CascadeLink {
        relay_id: a.to_owned(),
        mesh_id: mesh_id.to_owned(),
      },
    );
    Ok(())
  }

  /// Adds `node` to the mesh named `mesh_id`, linking it to every current
  /// member. The first node of a cascade joins without links; the second
  /// node brings the mesh into existence.
  pub fn add_node_to_mesh(&mut self, node: N, mesh_id: &str) -> Result<(), CascadeError> {
    let relay_id = node.relay_id().to_owned();
    if self.nodes.contains_key(&relay_id) {
      return Err(CascadeError::NodeExists(relay_id));
    }
    let peers: Vec<String> = if self.nodes.is_empty() {
      vec![]
    }
    else if self.nodes.len() == 1 {
      self.nodes.keys().cloned().collect()
    }
    else {
      let members = self.mesh_members(mesh_id);
      if members.is_empty() {
        return Err(CascadeError::UnknownMesh(mesh_id.to_owned()));
      }
      members.into_iter().collect()
    };
    debug!(relay_id, mesh_id, ?peers, "adding node to mesh");
    self.nodes.insert(relay_id.clone(), node);
    for peer in peers {
      self.link(&relay_id, &peer, mesh_id)?;
    }
    Ok(())
  }

  /// Starts a new mesh between `existing_id` and the new `node`.
  pub fn add_mesh(&mut self, existing_id: &str, node: N, mesh_id: &str) -> Result<(), CascadeError> {
    let relay_id = node.relay_id().to_owned();
    if !self.nodes.contains_key(existing_id) {
      return Err(CascadeError::UnknownNode(existing_id.to_owned()));
    }
    if self.nodes.contains_key(&relay_id) {
      return Err(CascadeError::NodeExists(relay_id));
    }
    if !self.mesh_members(mesh_id).is_empty() {
      return Err(CascadeError::MeshExists(mesh_id.to_owned()));
    }
    debug!(relay_id, existing_id, mesh_id, "adding new mesh");
    self.nodes.insert(relay_id.clone(), node);
    self.link(&relay_id, existing_id, mesh_id)
  }

  /// Removes a node and its backlinks. When the node bridged two or more
  /// meshes, `repair` is consulted for the links (a, b, mesh id) that
  /// reconnect the severed fragments.
  pub fn remove_node(
    &mut self,
    relay_id: &str,
    repair: impl FnOnce(&Cascade<N>, &BTreeSet<String>) -> Vec<(String, String, String)>,
  ) -> Result<Option<N>, CascadeError> {
    let node = match self.nodes.remove(relay_id) {
      Some(node) => node,
      None => return Ok(None),
    };
    let mut severed_meshes = BTreeSet::new();
    for link in node.links().values() {
      severed_meshes.insert(link.mesh_id.clone());
      if let Some(peer) = self.nodes.get_mut(&link.relay_id) {
        peer.links_mut().remove(relay_id);
      }
    }
    if severed_meshes.len() >= 2 {
      debug!(relay_id, ?severed_meshes, "removed node bridged meshes, repairing");
      for (a, b, mesh_id) in repair(self, &severed_meshes) {
        self.link(&a, &b, &mesh_id)?;
      }
    }
    Ok(Some(node))
  }

  /// The set of nodes reachable from `toward` without crossing back through
  /// the mesh that links `from` to `toward`. Includes `toward` itself.
  pub fn get_nodes_behind(&self, from: &str, toward: &str) -> Result<BTreeSet<String>, CascadeError> {
    let from_node = self
      .nodes
      .get(from)
      .ok_or_else(|| CascadeError::UnknownNode(from.to_owned()))?;
    let blocked_mesh = from_node
      .links()
      .get(toward)
      .ok_or_else(|| CascadeError::UnknownNode(toward.to_owned()))?
      .mesh_id
      .clone();
    let mut behind = BTreeSet::new();
    let mut queue = VecDeque::new();
    behind.insert(toward.to_owned());
    queue.push_back(toward.to_owned());
    while let Some(current) = queue.pop_front() {
      let node = self
        .nodes
        .get(&current)
        .ok_or_else(|| CascadeError::UnknownNode(current.clone()))?;
      for link in node.links().values() {
        if link.mesh_id == blocked_mesh {
          continue;
        }
        if behind.insert(link.relay_id.clone()) {
          queue.push_back(link.relay_id.clone());
        }
      }
    }
    Ok(behind)
  }

  /// Checks every cascade invariant: symmetric links, complete meshes,
  /// connectivity, and a single path between any two nodes (paths within a
  /// mesh count as one hop).
  pub fn validate(&self) -> Result<(), CascadeError> {
    let mut mesh_membership: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for (relay_id, node) in &self.nodes {
      for (peer_id, link) in node.links() {
        if peer_id != &link.relay_id {
          return Err(CascadeError::AsymmetricLink(relay_id.clone(), peer_id.clone()));
        }
        if peer_id == relay_id {
          return Err(CascadeError::SelfLink);
        }
        let peer = self
          .nodes
          .get(peer_id)
          .ok_or_else(|| CascadeError::UnknownNode(peer_id.clone()))?;
        let backlink = peer
          .links()
          .get(relay_id)
          .ok_or_else(|| CascadeError::AsymmetricLink(relay_id.clone(), peer_id.clone()))?;
        if backlink.mesh_id != link.mesh_id {
          return Err(CascadeError::AsymmetricLink(relay_id.clone(), peer_id.clone()));
        }
        let members = mesh_membership.entry(link.mesh_id.clone()).or_default();
        members.insert(relay_id.clone());
        members.insert(peer_id.clone());
      }
    }

    // Every pair within a mesh must be directly linked.
    for (mesh_id, members) in &mesh_membership {
      for a in members {
        for b in members {
          if a >= b {
            continue;
          }
          let linked = self
            .nodes
            .get(a)
            .and_then(|node| node.links().get(b))
            .map(|link| &link.mesh_id == mesh_id)
            .unwrap_or_default();
          if !linked {
            return Err(CascadeError::MeshIncomplete(mesh_id.clone()));
          }
        }
      }
    }

    if self.nodes.is_empty() {
      return Ok(());
    }

    // Connectivity.
    let start = self.nodes.keys().next().unwrap().clone();
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::new();
    seen.insert(start.clone());
    queue.push_back(start);
    while let Some(current) = queue.pop_front() {
      for link in self.nodes[&current].links().values() {
        if seen.insert(link.relay_id.clone()) {
          queue.push_back(link.relay_id.clone());
        }
      }
    }
    if seen.len() != self.nodes.len() {
      return Err(CascadeError::Disconnected);
    }

    // Contracting each mesh to a vertex must leave a tree: in the bipartite
    // node/mesh incidence graph, edges == nodes-in-meshes, and a tree has
    // exactly (nodes + meshes - 1) of them.
    let incidences: usize = mesh_membership.values().map(BTreeSet::len).sum();
    let nodes_in_meshes: BTreeSet<&String> = mesh_membership.values().flatten().collect();
    let isolated = self.nodes.len() - nodes_in_meshes.len();
    if isolated > 0 && self.nodes.len() > 1 {
      return Err(CascadeError::Disconnected);
    }
    if !mesh_membership.is_empty()
      && incidences != nodes_in_meshes.len() + mesh_membership.len() - 1
    {
      return Err(CascadeError::DuplicatePaths);
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Debug)]
  struct TestNode {
    relay_id: String,
    links: BTreeMap<String, CascadeLink>,
  }

  impl TestNode {
    fn new(relay_id: &str) -> TestNode {
      TestNode {
        relay_id: relay_id.to_owned(),
        links: BTreeMap::new(),
      }
    }
  }

  impl CascadeNode for TestNode {
    fn relay_id(&self) -> &str {
      &self.relay_id
    }

    fn links(&self) -> &BTreeMap<String, CascadeLink> {
      &self.links
    }

    fn links_mut(&mut self) -> &mut BTreeMap<String, CascadeLink> {
      &mut self.links
    }
  }

  fn no_repair(_: &Cascade<TestNode>, _: &BTreeSet<String>) -> Vec<(String, String, String)> {
    vec![]
  }

  /// A,B in mesh X; C,D in mesh Y; B and C joined by mesh M.
  fn bridged_cascade() -> Cascade<TestNode> {
    let mut cascade = Cascade::new();
    cascade.add_node_to_mesh(TestNode::new("A"), "X").unwrap();
    cascade.add_node_to_mesh(TestNode::new("B"), "X").unwrap();
    cascade.add_mesh("B", TestNode::new("C"), "M").unwrap();
    cascade.add_mesh("C", TestNode::new("D"), "Y").unwrap();
    cascade.validate().unwrap();
    cascade
  }

  #[test]
  fn grows_a_single_mesh() {
    let mut cascade = Cascade::new();
    cascade.add_node_to_mesh(TestNode::new("A"), "X").unwrap();
    cascade.add_node_to_mesh(TestNode::new("B"), "X").unwrap();
    cascade.add_node_to_mesh(TestNode::new("C"), "X").unwrap();
    cascade.validate().unwrap();
    assert_eq!(cascade.get("A").unwrap().links().len(), 2);
    assert_eq!(cascade.mesh_members("X").len(), 3);
  }

  #[test]
  fn rejects_unknown_mesh() {
    let mut cascade = Cascade::new();
    cascade.add_node_to_mesh(TestNode::new("A"), "X").unwrap();
    cascade.add_node_to_mesh(TestNode::new("B"), "X").unwrap();
    assert_eq!(
      cascade.add_node_to_mesh(TestNode::new("C"), "Z"),
      Err(CascadeError::UnknownMesh("Z".to_owned()))
    );
  }

  #[test]
  fn rejects_duplicate_mesh_id() {
    let mut cascade = Cascade::new();
    cascade.add_node_to_mesh(TestNode::new("A"), "X").unwrap();
    cascade.add_node_to_mesh(TestNode::new("B"), "X").unwrap();
    assert_eq!(
      cascade.add_mesh("A", TestNode::new("C"), "X"),
      Err(CascadeError::MeshExists("X".to_owned()))
    );
  }

  #[test]
  fn nodes_behind_stops_at_blocking_mesh() {
    let cascade = bridged_cascade();
    let behind = cascade.get_nodes_behind("B", "C").unwrap();
    assert_eq!(
      behind,
      ["C", "D"].into_iter().map(ToOwned::to_owned).collect()
    );
    let behind = cascade.get_nodes_behind("C", "B").unwrap();
    assert_eq!(
      behind,
      ["A", "B"].into_iter().map(ToOwned::to_owned).collect()
    );
  }

  #[test]
  fn removing_a_bridging_node_requires_repair() {
    let mut cascade = bridged_cascade();
    cascade.remove_node("B", no_repair).unwrap();
    assert_eq!(cascade.validate(), Err(CascadeError::Disconnected));
  }

  #[test]
  fn repair_restores_validity() {
    let mut cascade = bridged_cascade();
    cascade
      .remove_node("B", |_, severed| {
        assert!(severed.contains("X"));
        assert!(severed.contains("M"));
        vec![("A".to_owned(), "C".to_owned(), "R".to_owned())]
      })
      .unwrap();
    cascade.validate().unwrap();
    let behind = cascade.get_nodes_behind("A", "C").unwrap();
    assert_eq!(
      behind,
      ["C", "D"].into_iter().map(ToOwned::to_owned).collect()
    );
  }

  #[test]
  fn remove_and_readd_reproduces_cascade() {
    let mut cascade = bridged_cascade();
    let removed = cascade.remove_node("D", no_repair).unwrap().unwrap();
    cascade.validate().unwrap();
    // D's departure dissolved mesh Y, so re-linking recreates it.
    cascade
      .add_mesh("C", TestNode::new(removed.relay_id()), "Y")
      .unwrap();
    cascade.validate().unwrap();
    assert_eq!(
      cascade.get("D").unwrap().links().len(),
      1
    );
    assert_eq!(cascade.mesh_members("Y").len(), 2);
  }

  #[test]
  fn removing_a_leaf_needs_no_repair() {
    let mut cascade = bridged_cascade();
    cascade.remove_node("A", no_repair).unwrap();
    cascade.validate().unwrap();
  }

  #[test]
  fn detects_duplicate_paths() {
    let mut cascade = bridged_cascade();
    // A second path between the two meshes.
    cascade.link("A", "D", "EXTRA").unwrap();
    assert_eq!(cascade.validate(), Err(CascadeError::DuplicatePaths));
  }

  #[test]
  fn removing_last_member_of_mesh_leaves_valid_cascade() {
    let mut cascade = Cascade::new();
    cascade.add_node_to_mesh(TestNode::new("A"), "X").unwrap();
    cascade.add_node_to_mesh(TestNode::new("B"), "X").unwrap();
    cascade.remove_node("B", no_repair).unwrap();
    cascade.validate().unwrap();
    assert_eq!(cascade.len(), 1);
  }
}
