use std::{
  collections::{BTreeMap, BTreeSet, HashMap},
  fmt,
  sync::Arc,
};

use anyhow::{anyhow, Result};
use jitsi_xmpp_parsers::{
  colibri2::{
    ConferenceModified, ConferenceModify, Endpoint, Media, MediaSource, Relay,
    Transport as ColibriTransport,
  },
  jingle::{Content, Description as JingleDescription, Transport as JingleTransport},
  jingle_rtp::Description as RtpDescription,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use xmpp_parsers::{
  iq::Iq,
  jingle::{ContentId, Creator, Senders},
  jingle_rtp::{PayloadType, RtcpMux},
  Element, FullJid, Jid,
};

use crate::{
  bridge::{
    cascade::{Cascade, CascadeLink, CascadeNode},
    selector::BridgeSelector,
    Bridge,
  },
  source::{ConferenceSourceMap, MediaType},
  stats::FocusStats,
  xmpp::router::{unique_iq_id, IqResponse, IqSender},
};

/// The single mesh conferences grow in until a topology policy says
/// otherwise.
const DEFAULT_MESH_ID: &str = "0";

#[derive(Debug, Error)]
pub enum ColibriError {
  /// Selection found nothing; the conference ends with resource-constraint.
  #[error("no usable bridge")]
  NoBridgeAvailable,

  /// The bridge errored or timed out; it has been marked failed and its
  /// endpoints need to move.
  #[error("bridge failed: {0}")]
  BridgeFailed(String),

  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

/// What a successful channel allocation hands back to the invite path.
#[derive(Debug, Clone)]
pub struct EndpointAllocation {
  pub bridge_id: String,
  /// The bridge's ICE transport, forwarded opaquely into the Jingle offer.
  pub transport: Option<Element>,
}

/// One (conference, bridge) binding and its relay links.
pub struct BridgeSession {
  bridge: Bridge,
  relay_key: String,
  endpoints: BTreeSet<String>,
  links: BTreeMap<String, CascadeLink>,
}

impl BridgeSession {
  fn new(bridge: Bridge) -> BridgeSession {
    let relay_key = bridge
      .relay_id
      .clone()
      .unwrap_or_else(|| bridge.id());
    BridgeSession {
      bridge,
      relay_key,
      endpoints: BTreeSet::new(),
      links: BTreeMap::new(),
    }
  }
}

impl fmt::Debug for BridgeSession {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BridgeSession")
      .field("bridge", &self.bridge.id())
      .field("endpoints", &self.endpoints.len())
      .finish()
  }
}

impl CascadeNode for BridgeSession {
  fn relay_id(&self) -> &str {
    &self.relay_key
  }

  fn links(&self) -> &BTreeMap<String, CascadeLink> {
    &self.links
  }

  fn links_mut(&mut self) -> &mut BTreeMap<String, CascadeLink> {
    &mut self.links
  }
}

struct ManagerInner {
  cascade: Cascade<BridgeSession>,
  /// endpoint id -> relay key of the hosting bridge session.
  endpoints: HashMap<String, String>,
  /// Bridge version the conference is pinned to, set on first allocation.
  version_pin: Option<String>,
}

/// Per-conference allocation of bridge channels, and the cascade that ties
/// multiple bridges into one conference.
pub struct ColibriSessionManager {
  sender: Arc<dyn IqSender>,
  selector: BridgeSelector,
  local_jid: FullJid,
  meeting_id: String,
  room_name: String,
  stats: Arc<FocusStats>,
  inner: Mutex<ManagerInner>,
}

impl ColibriSessionManager {
  pub fn new(
    sender: Arc<dyn IqSender>,
    selector: BridgeSelector,
    local_jid: FullJid,
    meeting_id: String,
    room_name: String,
    stats: Arc<FocusStats>,
  ) -> ColibriSessionManager {
    ColibriSessionManager {
      sender,
      selector,
      local_jid,
      meeting_id,
      room_name,
      stats,
      inner: Mutex::new(ManagerInner {
        cascade: Cascade::new(),
        endpoints: HashMap::new(),
        version_pin: None,
      }),
    }
  }

  pub async fn bridge_count(&self) -> usize {
    self.inner.lock().await.cascade.len()
  }

  pub async fn bridge_of(&self, endpoint_id: &str) -> Option<String> {
    let inner = self.inner.lock().await;
    let relay_key = inner.endpoints.get(endpoint_id)?;
    inner
      .cascade
      .get(relay_key)
      .map(|session| session.bridge.id())
  }

  pub async fn endpoints_on(&self, bridge_id: &str) -> Vec<String> {
    let inner = self.inner.lock().await;
    inner
      .cascade
      .nodes()
      .filter(|session| session.bridge.id() == bridge_id)
      .flat_map(|session| session.endpoints.iter().cloned())
      .collect()
  }

  pub async fn bridge_endpoint_counts(&self) -> HashMap<String, usize> {
    let inner = self.inner.lock().await;
    inner
      .cascade
      .nodes()
      .map(|session| (session.bridge.id(), session.endpoints.len()))
      .collect()
  }

  async fn send_to_bridge(
    &self,
    bridge_jid: &FullJid,
    request: ConferenceModify,
  ) -> Result<ConferenceModified, ColibriError> {
    let bridge_id = bridge_jid.to_string();
    let iq = Iq::from_set(unique_iq_id(), request)
      .with_to(Jid::Full(bridge_jid.clone()))
      .with_from(Jid::Full(self.local_jid.clone()));
    match self.sender.send_iq(iq).await {
      Ok(IqResponse::Result(Some(payload))) => ConferenceModified::try_from(payload)
        .map_err(|e| ColibriError::Other(anyhow!("malformed conference-modified: {}", e))),
      Ok(IqResponse::Result(None)) => Ok(ConferenceModified::default()),
      Ok(IqResponse::Error(error)) => {
        warn!(bridge = bridge_id.as_str(), "colibri request rejected: {:?}", error);
        self.mark_bridge_failed(&bridge_id);
        Err(ColibriError::BridgeFailed(bridge_id))
      },
      Err(e) => {
        warn!(bridge = bridge_id.as_str(), "colibri request failed: {:?}", e);
        self.mark_bridge_failed(&bridge_id);
        Err(ColibriError::BridgeFailed(bridge_id))
      },
    }
  }

  fn mark_bridge_failed(&self, bridge_id: &str) {
    FocusStats::bump(&self.stats.bridges_failed);
    self.selector.registry().mark_failed(bridge_id);
  }

  /// Allocates audio, video and data channels for one endpoint, growing the
  /// cascade onto a new bridge when selection asks for one. With
  /// `ssrc_rewriting` the bridge is asked to rewrite the endpoint's receive
  /// ssrcs.
  #[tracing::instrument(level = "debug", skip(self, initial_sources), err)]
  pub async fn allocate(
    &self,
    endpoint_id: &str,
    participant_region: Option<&str>,
    ssrc_rewriting: bool,
    initial_sources: Option<&ConferenceSourceMap>,
  ) -> Result<EndpointAllocation, ColibriError> {
    let (bridge, is_new_bridge, relay_peers) = {
      let inner = self.inner.lock().await;
      let counts: HashMap<String, usize> = inner
        .cascade
        .nodes()
        .map(|session| (session.bridge.id(), session.endpoints.len()))
        .collect();
      let bridge = self
        .selector
        .select(&counts, participant_region, inner.version_pin.as_deref())
        .ok_or(ColibriError::NoBridgeAvailable)?;
      let is_new = !counts.contains_key(&bridge.id());
      let relay_peers: Vec<(FullJid, String)> = if is_new {
        inner
          .cascade
          .nodes()
          .map(|session| (session.bridge.jid.clone(), session.relay_key.clone()))
          .collect()
      }
      else {
        vec![]
      };
      (bridge, is_new, relay_peers)
    };
    let bridge_id = bridge.id();

    let mut request = ConferenceModify::new(self.meeting_id.clone());
    if is_new_bridge {
      request.create = true;
      request.name = Some(self.room_name.clone());
      // Mesh the new bridge with every bridge already in the conference.
      for (_, peer_relay) in &relay_peers {
        let mut relay = Relay::new(peer_relay.clone());
        relay.create = true;
        relay.mesh_id = Some(DEFAULT_MESH_ID.to_owned());
        request.relays.push(relay);
      }
    }
    let mut endpoint = Endpoint::new(endpoint_id);
    endpoint.create = true;
    if ssrc_rewriting {
      endpoint.capabilities.push("ssrc-rewriting".to_owned());
    }
    endpoint.media = vec![Media::new("audio"), Media::new("video")];
    endpoint.transport = Some(ColibriTransport {
      ice_controlling: true,
      payload: None,
    });
    if let Some(sources) = initial_sources {
      endpoint.sources = media_sources(endpoint_id, sources);
    }
    request.endpoints.push(endpoint);

    let response = self.send_to_bridge(&bridge.jid, request).await?;
    let transport = response
      .endpoints
      .iter()
      .find(|endpoint| endpoint.id == endpoint_id)
      .and_then(|endpoint| endpoint.transport.as_ref())
      .and_then(|transport| transport.payload.clone());

    let new_bridge_relay = {
      let mut inner = self.inner.lock().await;
      if inner.version_pin.is_none() {
        inner.version_pin = bridge.version.clone();
      }
      let session = BridgeSession::new(bridge.clone());
      let relay_key = session.relay_key.clone();
      let added = if is_new_bridge && !inner.cascade.contains(&relay_key) {
        inner
          .cascade
          .add_node_to_mesh(session, DEFAULT_MESH_ID)
          .map_err(|e| ColibriError::Other(anyhow!(e)))?;
        true
      }
      else {
        false
      };
      if let Some(session) = inner.cascade.get_mut(&relay_key) {
        session.endpoints.insert(endpoint_id.to_owned());
      }
      inner.endpoints.insert(endpoint_id.to_owned(), relay_key.clone());
      added.then_some(relay_key)
    };

    // Tell the bridges already in the conference about their new peer.
    if let Some(new_relay) = new_bridge_relay {
      for (peer_jid, _) in &relay_peers {
        let mut peer_request = ConferenceModify::new(self.meeting_id.clone());
        let mut relay = Relay::new(new_relay.clone());
        relay.create = true;
        relay.mesh_id = Some(DEFAULT_MESH_ID.to_owned());
        peer_request.relays.push(relay);
        if let Err(e) = self.send_to_bridge(peer_jid, peer_request).await {
          warn!(
            bridge = %peer_jid,
            "failed to extend cascade to peer bridge: {:?}",
            e
          );
        }
      }
    }

    self.selector.registry().endpoint_added(&bridge_id);
    self.selector.registry().clear_failure(&bridge_id);
    debug!(endpoint_id, bridge = bridge_id.as_str(), "allocated channels");
    Ok(EndpointAllocation {
      bridge_id,
      transport,
    })
  }

  /// Pushes source additions and removals for an endpoint to its bridge so
  /// relays forward correctly.
  pub async fn update_sources(
    &self,
    endpoint_id: &str,
    sources: &ConferenceSourceMap,
  ) -> Result<(), ColibriError> {
    let bridge_jid = {
      let inner = self.inner.lock().await;
      let relay_key = match inner.endpoints.get(endpoint_id) {
        Some(relay_key) => relay_key,
        None => return Ok(()),
      };
      match inner.cascade.get(relay_key) {
        Some(session) => session.bridge.jid.clone(),
        None => return Ok(()),
      }
    };
    let mut request = ConferenceModify::new(self.meeting_id.clone());
    let mut endpoint = Endpoint::new(endpoint_id);
    endpoint.sources = media_sources(endpoint_id, sources);
    request.endpoints.push(endpoint);
    self.send_to_bridge(&bridge_jid, request).await?;
    Ok(())
  }

  /// Frees the endpoint's channels. Returns the id of a bridge that left
  /// the conference because this was its last endpoint.
  #[tracing::instrument(level = "debug", skip(self), err)]
  pub async fn expire(&self, endpoint_id: &str) -> Result<Option<String>, ColibriError> {
    let (bridge_jid, now_empty) = {
      let mut inner = self.inner.lock().await;
      let relay_key = match inner.endpoints.remove(endpoint_id) {
        Some(relay_key) => relay_key,
        None => return Ok(None),
      };
      let session = match inner.cascade.get_mut(&relay_key) {
        Some(session) => session,
        None => return Ok(None),
      };
      session.endpoints.remove(endpoint_id);
      let now_empty = session.endpoints.is_empty();
      let bridge_jid = session.bridge.jid.clone();
      if now_empty {
        inner
          .cascade
          .remove_node(&relay_key, |_, _| vec![])
          .map_err(|e| ColibriError::Other(anyhow!(e)))?;
        info!(bridge = %bridge_jid, "last endpoint gone, dropping bridge from conference");
      }
      (bridge_jid, now_empty)
    };

    let mut request = ConferenceModify::new(self.meeting_id.clone());
    if now_empty {
      request.expire = true;
    }
    else {
      let mut endpoint = Endpoint::new(endpoint_id);
      endpoint.expire = true;
      request.endpoints.push(endpoint);
    }
    // Expiry is best-effort; a failure here only matters for the bridge's
    // own bookkeeping.
    if let Err(e) = self.send_to_bridge(&bridge_jid, request).await {
      debug!(bridge = %bridge_jid, "expire request failed: {:?}", e);
    }
    if now_empty {
      Ok(Some(bridge_jid.to_string()))
    }
    else {
      Ok(None)
    }
  }

  /// Drops a failed bridge from the conference without talking to it.
  /// Returns the endpoints that lost their allocation and must be
  /// re-invited.
  pub async fn remove_bridge(&self, bridge_id: &str) -> Vec<String> {
    let mut inner = self.inner.lock().await;
    let relay_key = match inner
      .cascade
      .nodes()
      .find(|session| session.bridge.id() == bridge_id)
    {
      Some(session) => session.relay_key.clone(),
      None => return vec![],
    };
    let removed = inner
      .cascade
      .remove_node(&relay_key, |_, _| vec![])
      .ok()
      .flatten();
    let endpoints: Vec<String> = removed
      .map(|session| session.endpoints.into_iter().collect())
      .unwrap_or_default();
    for endpoint_id in &endpoints {
      inner.endpoints.remove(endpoint_id);
    }
    FocusStats::bump(&self.stats.bridges_removed);
    endpoints
  }

  /// Expires the whole conference on every bridge.
  pub async fn expire_all(&self) {
    let bridge_jids: Vec<FullJid> = {
      let inner = self.inner.lock().await;
      inner
        .cascade
        .nodes()
        .map(|session| session.bridge.jid.clone())
        .collect()
    };
    for bridge_jid in bridge_jids {
      let mut request = ConferenceModify::new(self.meeting_id.clone());
      request.expire = true;
      if let Err(e) = self.send_to_bridge(&bridge_jid, request).await {
        debug!(bridge = %bridge_jid, "conference expire failed: {:?}", e);
      }
    }
    let mut inner = self.inner.lock().await;
    inner.cascade = Cascade::new();
    inner.endpoints.clear();
  }
}

fn media_sources(endpoint_id: &str, sources: &ConferenceSourceMap) -> Vec<MediaSource> {
  let set = match sources.get(endpoint_id) {
    Some(set) => set,
    None => return vec![],
  };
  let mut result = Vec::new();
  for media_type in [MediaType::Audio, MediaType::Video] {
    let mut media_source = MediaSource::new(media_type.to_string());
    media_source.id = Some(endpoint_id.to_owned());
    for source in &set.sources {
      if source.media_type == media_type {
        let mut signaled = jitsi_xmpp_parsers::jingle_ssma::Source::new(source.ssrc);
        signaled.name = source.name.clone();
        media_source.sources.push(signaled);
      }
    }
    for group in &set.ssrc_groups {
      if group.media_type == media_type {
        media_source.ssrc_groups.push(jitsi_xmpp_parsers::jingle_ssma::Group::new(
          group.semantics,
          group.ssrcs.iter().copied(),
        ));
      }
    }
    if !media_source.sources.is_empty() || !media_source.ssrc_groups.is_empty() {
      result.push(media_source);
    }
  }
  result
}

/// The codec payload types the focus offers. These mirror what Jitsi Meet
/// deployments negotiate by default.
pub fn build_offer_contents(allocation: &EndpointAllocation) -> Vec<Content> {
  let mut contents = Vec::new();
  for media_type in [MediaType::Audio, MediaType::Video] {
    let mut description = RtpDescription::new(media_type.to_string());
    description.payload_types = match media_type {
      MediaType::Audio => vec![PayloadType::new(111, "opus".to_owned(), 48000, 2)],
      MediaType::Video => vec![
        PayloadType::new(100, "VP8".to_owned(), 90000, 1),
        PayloadType::new(101, "VP9".to_owned(), 90000, 1),
        PayloadType::new(96, "rtx".to_owned(), 90000, 1),
      ],
    };
    description.rtcp_mux = Some(RtcpMux);
    let mut content = Content::new(Creator::Initiator, ContentId(media_type.to_string()))
      .with_senders(Senders::Both)
      .with_description(JingleDescription::Rtp(description));
    if let Some(transport) = &allocation.transport {
      if let Ok(transport) = JingleTransport::try_from(transport.clone()) {
        content = content.with_transport(transport);
      }
    }
    contents.push(content);
  }
  contents
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    bridge::BridgeRegistry,
    bridge::selector::SelectionStrategy,
    config::FocusConfig,
    test_support::MockSender,
  };
  use jitsi_xmpp_parsers::colibri_stats::BridgeStats;

  fn bridge_stats(region: &str) -> BridgeStats {
    BridgeStats::new()
      .with_stat("stress-level", 0.1)
      .with_stat("region", region)
      .with_stat("version", "2.3")
      .with_stat("relay-id", region)
  }

  fn manager_with_bridges(
    sender: Arc<MockSender>,
    regions: &[&str],
  ) -> (ColibriSessionManager, BridgeRegistry) {
    let config = FocusConfig::default();
    let registry = BridgeRegistry::new(&config);
    for region in regions {
      let jid: FullJid = format!("brewery@internal.example.com/{}", region)
        .parse()
        .unwrap();
      registry.update(jid, &bridge_stats(region));
    }
    let selector = BridgeSelector::new(registry.clone(), SelectionStrategy::RegionBasedWithCascade);
    let local: FullJid = "focus@auth.example.com/focus".parse().unwrap();
    let manager = ColibriSessionManager::new(
      sender,
      selector,
      local,
      "meeting-1".to_owned(),
      "r1@conference.example.com".to_owned(),
      FocusStats::new(),
    );
    (manager, registry)
  }

  #[tokio::test]
  async fn allocates_on_a_single_bridge() {
    let sender = Arc::new(MockSender::new());
    let (manager, _) = manager_with_bridges(sender.clone(), &["eu-west"]);
    let allocation = manager.allocate("e1", Some("eu-west"), false, None).await.unwrap();
    assert_eq!(
      allocation.bridge_id,
      "brewery@internal.example.com/eu-west"
    );
    assert_eq!(manager.bridge_count().await, 1);
    assert_eq!(manager.bridge_of("e1").await, Some(allocation.bridge_id));
  }

  #[tokio::test]
  async fn grows_cascade_for_second_region() {
    let sender = Arc::new(MockSender::new());
    let (manager, _) = manager_with_bridges(sender.clone(), &["eu-west", "us-east"]);
    manager.allocate("e1", Some("eu-west"), false, None).await.unwrap();
    manager.allocate("e2", Some("us-east"), false, None).await.unwrap();
    assert_eq!(manager.bridge_count().await, 2);
    // Allocation IQs plus the relay extension to the first bridge.
    assert!(sender.sent_count() >= 3);
  }

  #[tokio::test]
  async fn ssrc_rewriting_is_requested_as_a_capability() {
    let sender = Arc::new(MockSender::new());
    let (manager, _) = manager_with_bridges(sender.clone(), &["eu-west"]);
    manager.allocate("e1", None, true, None).await.unwrap();
    let request = &sender.sent_stanzas()[0];
    let has_capability = request
      .children()
      .flat_map(|conference| conference.children())
      .flat_map(|endpoint| endpoint.children())
      .any(|child| {
        child.name() == "capability" && child.attr("name") == Some("ssrc-rewriting")
      });
    assert!(has_capability);
  }

  #[tokio::test]
  async fn no_bridges_is_a_resource_constraint() {
    let sender = Arc::new(MockSender::new());
    let (manager, _) = manager_with_bridges(sender, &[]);
    assert!(matches!(
      manager.allocate("e1", None, false, None).await,
      Err(ColibriError::NoBridgeAvailable)
    ));
  }

  #[tokio::test]
  async fn bridge_error_marks_failure_and_reports() {
    let sender = Arc::new(MockSender::new());
    sender.push_response(IqResponse::Error(
      crate::error::StanzaErrorKind::InternalServerError.to_stanza_error("boom"),
    ));
    let (manager, registry) = manager_with_bridges(sender, &["eu-west"]);
    let result = manager.allocate("e1", Some("eu-west"), false, None).await;
    assert!(matches!(result, Err(ColibriError::BridgeFailed(_))));
    let snapshot = &registry.snapshot()[0];
    assert!(snapshot.in_failure_cooldown);
  }

  #[tokio::test]
  async fn expire_last_endpoint_drops_bridge() {
    let sender = Arc::new(MockSender::new());
    let (manager, _) = manager_with_bridges(sender, &["eu-west"]);
    manager.allocate("e1", None, false, None).await.unwrap();
    let removed = manager.expire("e1").await.unwrap();
    assert_eq!(removed, Some("brewery@internal.example.com/eu-west".to_owned()));
    assert_eq!(manager.bridge_count().await, 0);
  }

  #[tokio::test]
  async fn remove_bridge_reports_orphaned_endpoints() {
    let sender = Arc::new(MockSender::new());
    let (manager, _) = manager_with_bridges(sender, &["eu-west"]);
    manager.allocate("e1", None, false, None).await.unwrap();
    manager.allocate("e2", None, false, None).await.unwrap();
    let orphaned = manager
      .remove_bridge("brewery@internal.example.com/eu-west")
      .await;
    assert_eq!(orphaned.len(), 2);
    assert_eq!(manager.bridge_count().await, 0);
  }

  #[test]
  fn offer_carries_transport_and_codecs() {
    let transport: Element =
      "<transport ufrag='u' pwd='p' xmlns='urn:xmpp:jingle:transports:ice-udp:1'/>"
        .parse()
        .unwrap();
    let allocation = EndpointAllocation {
      bridge_id: "b1".to_owned(),
      transport: Some(transport),
    };
    let contents = build_offer_contents(&allocation);
    assert_eq!(contents.len(), 2);
    assert!(contents.iter().all(|content| content.transport.is_some()));
  }
}
