use std::{
  collections::HashMap,
  fmt,
  sync::{Arc, Weak},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use jitsi_xmpp_parsers::{
  jibri_iq::{JibriAction, JibriIq},
  jingle::{Action, Jingle},
  ns::JITSI_FOCUS,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use xmpp_parsers::{jingle::Reason, BareJid, Element, FullJid};

use crate::{
  colibri::{build_offer_contents, ColibriError, ColibriSessionManager},
  config::FocusConfig,
  error::StanzaErrorKind,
  jibri::{session::JibriConferenceDispatcher, JibriDetector},
  jingle::{JingleRequestHandler, JingleSession, JingleSessionRegistry, JingleState},
  participant::Participant,
  source::{try_add, ConferenceSourceMap, EndpointSourceSet},
  source_signaling::SignalingOp,
  stats::FocusStats,
  task_queue::TaskQueue,
  xmpp::{
    muc::{MucOccupant, MucRoom, MucRoomHandler},
    router::IqSender,
  },
};

const FOCUS_NICK: &str = "focus";

struct ConferenceInner {
  participants: HashMap<String, Participant>,
  sources: ConferenceSourceMap,
  ended: bool,
}

/// One conference: its MUC, its participants, its bridges and its helpers.
/// All state mutations run on the conference's serial task queue.
pub struct JitsiConference {
  config: FocusConfig,
  room: MucRoom,
  sender: Arc<dyn IqSender>,
  colibri: ColibriSessionManager,
  jingle_registry: JingleSessionRegistry,
  jibri: Arc<JibriConferenceDispatcher>,
  stats: Arc<FocusStats>,
  queue: TaskQueue,
  inner: Mutex<ConferenceInner>,
  self_weak: Weak<JitsiConference>,
}

impl fmt::Debug for JitsiConference {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JitsiConference")
      .field("room", self.room.jid())
      .finish()
  }
}

impl JitsiConference {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    config: FocusConfig,
    sender: Arc<dyn IqSender>,
    colibri: ColibriSessionManager,
    jingle_registry: JingleSessionRegistry,
    jibri_detector: JibriDetector,
    focus_jid: FullJid,
    room_jid: BareJid,
    stats: Arc<FocusStats>,
  ) -> Arc<JitsiConference> {
    let room = MucRoom::new(sender.clone(), room_jid.clone(), FOCUS_NICK);
    let jibri = JibriConferenceDispatcher::new(
      jibri_detector,
      sender.clone(),
      focus_jid,
      room.clone(),
      config.jibri_pending_timeout,
      config.jibri_num_retries,
      stats.clone(),
    );
    FocusStats::bump(&stats.conferences_created);
    Arc::new_cyclic(|self_weak| JitsiConference {
      config,
      room,
      sender,
      colibri,
      jingle_registry,
      jibri,
      stats,
      queue: TaskQueue::new(room_jid.to_string()),
      inner: Mutex::new(ConferenceInner {
        participants: HashMap::new(),
        sources: ConferenceSourceMap::new(),
        ended: false,
      }),
      self_weak: self_weak.clone(),
    })
  }

  fn self_arc(&self) -> Option<Arc<JitsiConference>> {
    self.self_weak.upgrade()
  }

  pub fn room_jid(&self) -> &BareJid {
    self.room.jid()
  }

  pub fn muc_room(&self) -> &MucRoom {
    &self.room
  }

  /// Joins the MUC and starts listening for members.
  pub async fn start(self: &Arc<Self>) -> Result<()> {
    let handler: Arc<dyn MucRoomHandler> = Arc::new(ConferenceMucHandler(Arc::downgrade(self)));
    self.room.set_handler(handler).await;
    self.room.join(vec![]).await
  }

  pub async fn is_ended(&self) -> bool {
    self.inner.lock().await.ended
  }

  pub async fn participant_count(&self) -> usize {
    self.inner.lock().await.participants.len()
  }

  pub async fn bridge_endpoint_counts(&self) -> HashMap<String, usize> {
    self.colibri.bridge_endpoint_counts().await
  }

  pub async fn endpoints_on_bridge(&self, bridge_id: &str) -> Vec<String> {
    self.colibri.endpoints_on(bridge_id).await
  }

  async fn publish_conference_properties(&self) {
    let bridge_count = self.colibri.bridge_count().await;
    let properties = Element::builder("conference-properties", JITSI_FOCUS)
      .append(
        Element::builder("property", JITSI_FOCUS)
          .attr("key", "bridge-count")
          .attr("value", bridge_count.to_string())
          .build(),
      )
      .build();
    if let Err(e) = self.room.update_presence_extension(properties).await {
      debug!("failed to publish conference properties: {:?}", e);
    }
  }

  async fn handle_member_joined(self: Arc<Self>, occupant: MucOccupant) {
    let endpoint_id = occupant.nick().to_owned();
    {
      let mut inner = self.inner.lock().await;
      if inner.ended || inner.participants.contains_key(&endpoint_id) {
        return;
      }
      let region = Participant::region_from_occupant(&occupant);
      info!(room = %self.room.jid(), endpoint_id = endpoint_id.as_str(), "member joined");
      inner
        .participants
        .insert(endpoint_id.clone(), Participant::new(&occupant, region));
      FocusStats::bump(&self.stats.participants);
    }
    if let Err(e) = self.invite_participant(&endpoint_id).await {
      warn!(endpoint_id = endpoint_id.as_str(), "invite failed: {:?}", e);
    }
  }

  async fn handle_member_presence(self: Arc<Self>, occupant: MucOccupant) {
    let mut inner = self.inner.lock().await;
    if let Some(participant) = inner.participants.get_mut(occupant.nick()) {
      participant.is_moderator = occupant.is_moderator();
    }
  }

  async fn handle_member_left(self: Arc<Self>, occupant: MucOccupant) {
    let endpoint_id = occupant.nick().to_owned();
    let participant = {
      let mut inner = self.inner.lock().await;
      inner.participants.remove(&endpoint_id)
    };
    let participant = match participant {
      Some(participant) => participant,
      None => return,
    };
    info!(room = %self.room.jid(), endpoint_id = endpoint_id.as_str(), "member left");
    FocusStats::drop_one(&self.stats.participants);
    if let Some(session) = &participant.jingle_session {
      self.jingle_registry.unregister(session.sid());
      let _ = session.terminate(Reason::Gone, None, false).await;
    }
    if let Err(e) = self.colibri.expire(&endpoint_id).await {
      debug!("expire failed: {:?}", e);
    }
    let removed = {
      let mut inner = self.inner.lock().await;
      match inner.sources.remove(&endpoint_id) {
        Some(set) if !set.is_empty() => {
          Some(ConferenceSourceMap::of_endpoint(endpoint_id.clone(), set))
        },
        _ => None,
      }
    };
    if let Some(removed) = removed {
      self.propagate_sources(&endpoint_id, None, Some(&removed)).await;
    }
    self.publish_conference_properties().await;
  }

  /// Whether the bridge should rewrite this endpoint's receive ssrcs: only
  /// when enabled and the client understands named sources.
  fn ssrc_rewriting_for(&self, participant: &Participant) -> bool {
    self.config.use_ssrc_rewriting && participant.features.source_names
  }

  /// Allocates channels and sends the initial offer to one participant.
  // Returns a manually-boxed future (rather than `async fn`) to break the
  // invite_participant/handle_bridge_failed/re_invite recursive async cycle,
  // which the compiler otherwise cannot prove is Send.
  fn invite_participant<'a>(
    self: &'a Arc<Self>,
    endpoint_id: &'a str,
  ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
    let (region, json_sources, ssrc_rewriting, occupant_jid, own_sources) = {
      let inner = self.inner.lock().await;
      let participant = inner
        .participants
        .get(endpoint_id)
        .ok_or_else(|| anyhow!("no such participant: {}", endpoint_id))?;
      (
        participant.region.clone(),
        participant.features.json_sources,
        self.ssrc_rewriting_for(participant),
        participant.occupant_jid.clone(),
        participant.sources.clone(),
      )
    };

    let initial_sources = if own_sources.is_empty() {
      None
    }
    else {
      Some(ConferenceSourceMap::of_endpoint(endpoint_id, own_sources))
    };

    let mut allocation = None;
    for attempt in 0..2 {
      match self
        .colibri
        .allocate(
          endpoint_id,
          region.as_deref(),
          ssrc_rewriting,
          initial_sources.as_ref(),
        )
        .await
      {
        Ok(result) => {
          allocation = Some(result);
          break;
        },
        Err(ColibriError::NoBridgeAvailable) => {
          warn!(room = %self.room.jid(), "no bridge for invite, ending conference");
          self
            .end_conference(Reason::Gone, "no bridge available")
            .await;
          return Err(anyhow!("no usable bridge"));
        },
        Err(ColibriError::BridgeFailed(bridge_id)) => {
          warn!(bridge = bridge_id.as_str(), attempt, "bridge failed during invite");
          // Boxed to keep the invite/re-invite future types finite.
          let recover: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
            Box::pin(self.clone().handle_bridge_failed(bridge_id));
          recover.await;
        },
        Err(ColibriError::Other(e)) => return Err(e),
      }
    }
    let allocation = match allocation {
      Some(allocation) => allocation,
      None => {
        self
          .end_conference(Reason::Gone, "bridge allocation kept failing")
          .await;
        return Err(anyhow!("bridge allocation kept failing"));
      },
    };

    let contents = build_offer_contents(&allocation);
    let current = {
      let inner = self.inner.lock().await;
      let mut current = inner.sources.clone();
      current.remove(endpoint_id);
      current
    };

    let handler: Arc<dyn JingleRequestHandler> = self
      .self_arc()
      .ok_or_else(|| anyhow!("conference is gone"))?;
    let session = Arc::new(JingleSession::new(
      self.room.own_occupant_jid(),
      occupant_jid,
      self.sender.clone(),
      Arc::downgrade(&handler),
      json_sources,
    ));
    self.jingle_registry.register(&session);
    {
      let mut inner = self.inner.lock().await;
      if let Some(participant) = inner.participants.get_mut(endpoint_id) {
        participant.jingle_session = Some(session.clone());
      }
    }

    match session.initiate(contents, &current).await {
      Ok(()) => {
        let mut inner = self.inner.lock().await;
        if let Some(participant) = inner.participants.get_mut(endpoint_id) {
          participant.signaling.mark_signaled(current);
        }
        drop(inner);
        self.publish_conference_properties().await;
        Ok(())
      },
      Err(e) => {
        self.jingle_registry.unregister(session.sid());
        let mut inner = self.inner.lock().await;
        if let Some(participant) = inner.participants.get_mut(endpoint_id) {
          participant.jingle_session = None;
        }
        Err(e)
      },
    }
    })
  }

  /// Every endpoint on a failed bridge gets moved to a fresh one.
  pub async fn handle_bridge_failed(self: Arc<Self>, bridge_id: String) {
    let orphaned = self.colibri.remove_bridge(&bridge_id).await;
    if orphaned.is_empty() {
      return;
    }
    info!(
      bridge = bridge_id.as_str(),
      endpoints = orphaned.len(),
      "re-inviting endpoints from failed bridge"
    );
    for endpoint_id in orphaned {
      if let Err(e) = self.re_invite(&endpoint_id).await {
        warn!(
          endpoint_id = endpoint_id.as_str(),
          "re-invite after bridge failure failed: {:?}",
          e
        );
      }
    }
    self.publish_conference_properties().await;
  }

  /// Moves one endpoint onto a freshly-selected bridge, preferring
  /// transport-replace and falling back to a full re-invite.
  async fn re_invite(self: &Arc<Self>, endpoint_id: &str) -> Result<()> {
    let session = {
      let inner = self.inner.lock().await;
      match inner.participants.get(endpoint_id) {
        Some(participant) => participant.jingle_session.clone(),
        None => return Ok(()),
      }
    };
    let active = session
      .as_ref()
      .map(|session| session.state() == JingleState::Active)
      .unwrap_or_default();
    if !active {
      return self.invite_participant(endpoint_id).await;
    }
    let session = session.unwrap();

    let (region, ssrc_rewriting, own_sources) = {
      let inner = self.inner.lock().await;
      let participant = inner
        .participants
        .get(endpoint_id)
        .ok_or_else(|| anyhow!("no such participant"))?;
      (
        participant.region.clone(),
        self.ssrc_rewriting_for(participant),
        participant.sources.clone(),
      )
    };
    let initial_sources = if own_sources.is_empty() {
      None
    }
    else {
      Some(ConferenceSourceMap::of_endpoint(endpoint_id, own_sources))
    };
    let allocation = match self
      .colibri
      .allocate(
        endpoint_id,
        region.as_deref(),
        ssrc_rewriting,
        initial_sources.as_ref(),
      )
      .await
    {
      Ok(allocation) => allocation,
      Err(ColibriError::NoBridgeAvailable) => {
        self
          .end_conference(Reason::Gone, "no bridge available")
          .await;
        return Err(anyhow!("no usable bridge"));
      },
      Err(e) => return Err(anyhow!(e)),
    };
    let contents = build_offer_contents(&allocation);
    let full = {
      let inner = self.inner.lock().await;
      let mut full = inner.sources.clone();
      full.remove(endpoint_id);
      full
    };
    match session.replace_transport(contents, &full).await {
      Ok(()) => {
        FocusStats::bump(&self.stats.participants_moved);
        let mut inner = self.inner.lock().await;
        if let Some(participant) = inner.participants.get_mut(endpoint_id) {
          participant.signaling.mark_signaled(full);
        }
        Ok(())
      },
      Err(e) => {
        // A dead transport-replace leaves the endpoint stranded; start
        // over with a clean session.
        warn!(
          endpoint_id,
          "transport-replace failed, falling back to re-invite: {:?}", e
        );
        self.jingle_registry.unregister(session.sid());
        let _ = session
          .terminate(Reason::ConnectivityError, None, true)
          .await;
        {
          let mut inner = self.inner.lock().await;
          if let Some(participant) = inner.participants.get_mut(endpoint_id) {
            participant.jingle_session = None;
          }
        }
        let result = self.invite_participant(endpoint_id).await;
        if result.is_ok() {
          FocusStats::bump(&self.stats.participants_moved);
        }
        result
      },
    }
  }

  /// Admin entry point: move one endpoint, optionally checking which bridge
  /// it is expected to be on. Returns whether it moved.
  pub async fn move_endpoint(
    self: &Arc<Self>,
    endpoint_id: &str,
    expected_bridge: Option<&str>,
  ) -> Result<bool> {
    let current = self.colibri.bridge_of(endpoint_id).await;
    let current = match current {
      Some(current) => current,
      None => return Ok(false),
    };
    if let Some(expected) = expected_bridge {
      if current != expected {
        return Ok(false);
      }
    }
    self.colibri.expire(endpoint_id).await.ok();
    let self_ = self.clone();
    let endpoint_id = endpoint_id.to_owned();
    self
      .queue
      .run(async move { self_.re_invite(&endpoint_id).await })
      .await??;
    Ok(true)
  }

  /// Applies a validated source update and fans the diff out to everyone
  /// else.
  async fn apply_source_add(
    &self,
    endpoint_id: &str,
    candidate: &EndpointSourceSet,
  ) -> Result<ConferenceSourceMap, StanzaErrorKind> {
    let mut inner = self.inner.lock().await;
    let accepted = match try_add(
      &inner.sources,
      endpoint_id,
      candidate,
      self.config.max_ssrcs_per_endpoint,
    ) {
      Ok(accepted) => accepted,
      Err(e) => {
        debug!(endpoint_id, "rejecting sources: {}", e);
        return Err(StanzaErrorKind::BadRequest);
      },
    };
    if accepted.is_empty() {
      return Ok(ConferenceSourceMap::new());
    }
    let added = ConferenceSourceMap::of_endpoint(endpoint_id, accepted.clone());
    inner.sources.add_all(&added);
    if let Some(participant) = inner.participants.get_mut(endpoint_id) {
      participant.sources = participant.sources.union(&accepted);
    }
    Ok(added)
  }

  async fn on_session_accept(
    self: &Arc<Self>,
    endpoint_id: &str,
    jingle: &Jingle,
  ) -> Option<StanzaErrorKind> {
    let session = {
      let inner = self.inner.lock().await;
      inner
        .participants
        .get(endpoint_id)?
        .jingle_session
        .clone()?
    };
    let candidate = session.extract_sources(endpoint_id, jingle);
    let mut added = ConferenceSourceMap::new();
    if let Some(set) = candidate.get(endpoint_id) {
      match self.apply_source_add(endpoint_id, set).await {
        Ok(accepted) => added = accepted,
        Err(kind) => return Some(kind),
      }
    }
    if !added.is_empty() {
      self.propagate_sources(endpoint_id, Some(&added), None).await;
      if let Err(e) = self.colibri.update_sources(endpoint_id, &added).await {
        debug!("colibri source update failed: {:?}", e);
      }
    }
    // The answer is in; release anything that queued up while inviting.
    self.drain_pending(endpoint_id).await;
    None
  }

  async fn on_source_add(
    self: &Arc<Self>,
    endpoint_id: &str,
    jingle: &Jingle,
  ) -> Option<StanzaErrorKind> {
    let session = {
      let inner = self.inner.lock().await;
      inner
        .participants
        .get(endpoint_id)?
        .jingle_session
        .clone()?
    };
    let candidate = session.extract_sources(endpoint_id, jingle);
    let set = match candidate.get(endpoint_id) {
      Some(set) => set.clone(),
      None => return Some(StanzaErrorKind::BadRequest),
    };
    match self.apply_source_add(endpoint_id, &set).await {
      Ok(added) if !added.is_empty() => {
        self.propagate_sources(endpoint_id, Some(&added), None).await;
        let current = {
          let inner = self.inner.lock().await;
          inner
            .sources
            .get(endpoint_id)
            .cloned()
            .map(|set| ConferenceSourceMap::of_endpoint(endpoint_id, set))
            .unwrap_or_default()
        };
        if let Err(e) = self.colibri.update_sources(endpoint_id, &current).await {
          debug!("colibri source update failed: {:?}", e);
        }
        None
      },
      Ok(_) => None,
      Err(kind) => Some(kind),
    }
  }

  async fn on_source_remove(
    self: &Arc<Self>,
    endpoint_id: &str,
    jingle: &Jingle,
  ) -> Option<StanzaErrorKind> {
    let session = {
      let inner = self.inner.lock().await;
      inner
        .participants
        .get(endpoint_id)?
        .jingle_session
        .clone()?
    };
    let requested = session.extract_sources(endpoint_id, jingle);
    let requested_set = match requested.get(endpoint_id) {
      Some(set) => set.clone(),
      None => return Some(StanzaErrorKind::BadRequest),
    };
    let removed = {
      let mut inner = self.inner.lock().await;
      let owned = match inner.sources.get(endpoint_id) {
        Some(owned) => owned.clone(),
        None => return Some(StanzaErrorKind::BadRequest),
      };
      if !requested_set
        .ssrcs()
        .iter()
        .all(|ssrc| owned.ssrcs().contains(ssrc))
      {
        return Some(StanzaErrorKind::BadRequest);
      }
      let removed = ConferenceSourceMap::of_endpoint(endpoint_id, requested_set);
      inner.sources.remove_all(&removed);
      if let Some(participant) = inner.participants.get_mut(endpoint_id) {
        participant.sources = participant
          .sources
          .difference(removed.get(endpoint_id).unwrap_or(&EndpointSourceSet::default()));
      }
      removed
    };
    self.propagate_sources(endpoint_id, None, Some(&removed)).await;
    let current = {
      let inner = self.inner.lock().await;
      inner
        .sources
        .get(endpoint_id)
        .cloned()
        .map(|set| ConferenceSourceMap::of_endpoint(endpoint_id, set))
        .unwrap_or_default()
    };
    if let Err(e) = self.colibri.update_sources(endpoint_id, &current).await {
      debug!("colibri source update failed: {:?}", e);
    }
    None
  }

  async fn on_session_terminate(self: &Arc<Self>, endpoint_id: &str) -> Option<StanzaErrorKind> {
    let occupant_jid = {
      let inner = self.inner.lock().await;
      inner.participants.get(endpoint_id)?.occupant_jid.clone()
    };
    let occupant = MucOccupant {
      occupant_jid,
      real_jid: None,
      role: xmpp_parsers::muc::user::Role::None,
      affiliation: xmpp_parsers::muc::user::Affiliation::None,
      payloads: vec![],
    };
    self.clone().handle_member_left(occupant).await;
    None
  }

  /// Fans a source diff out to every other participant, through each one's
  /// signaling filter. Peers without a live session get the ops queued.
  async fn propagate_sources(
    &self,
    from_endpoint: &str,
    added: Option<&ConferenceSourceMap>,
    removed: Option<&ConferenceSourceMap>,
  ) {
    let mut to_send: Vec<(Arc<JingleSession>, Vec<SignalingOp>)> = Vec::new();
    {
      let mut inner = self.inner.lock().await;
      for (endpoint_id, participant) in inner.participants.iter_mut() {
        if endpoint_id == from_endpoint {
          continue;
        }
        if let Some(added) = added {
          participant.signaling.add_sources(added);
        }
        if let Some(removed) = removed {
          participant.signaling.remove_sources(removed);
        }
        let ops = participant.signaling.flush();
        if ops.is_empty() {
          continue;
        }
        let session_ready = participant
          .jingle_session
          .as_ref()
          .map(|session| session.state() == JingleState::Active)
          .unwrap_or_default();
        if session_ready {
          to_send.push((participant.jingle_session.clone().unwrap(), ops));
        }
        else {
          for op in ops {
            match op {
              SignalingOp::Add(sources) => participant.pending_updates.push_add(sources),
              SignalingOp::Remove(sources) => participant.pending_updates.push_remove(sources),
            }
          }
        }
      }
    }
    for (session, ops) in to_send {
      for op in ops {
        let result = match &op {
          SignalingOp::Add(sources) => session.add_source(sources).await,
          SignalingOp::Remove(sources) => session.remove_source(sources).await,
        };
        if let Err(e) = result {
          warn!("failed to signal source update: {:?}", e);
        }
      }
    }
  }

  async fn drain_pending(&self, endpoint_id: &str) {
    let (session, ops) = {
      let mut inner = self.inner.lock().await;
      let participant = match inner.participants.get_mut(endpoint_id) {
        Some(participant) => participant,
        None => return,
      };
      let session = match &participant.jingle_session {
        Some(session) => session.clone(),
        None => return,
      };
      (session, participant.pending_updates.drain())
    };
    for op in ops {
      let result = match &op {
        SignalingOp::Add(sources) => session.add_source(sources).await,
        SignalingOp::Remove(sources) => session.remove_source(sources).await,
      };
      if let Err(e) = result {
        warn!("failed to flush queued source update: {:?}", e);
      }
    }
  }

  /// Routes a Jibri IQ: moderator start/stop requests, or a status update
  /// from a Jibri instance.
  pub async fn handle_jibri_iq(
    self: &Arc<Self>,
    from: &FullJid,
    iq: &JibriIq,
  ) -> Result<JibriIq, (StanzaErrorKind, String)> {
    match iq.action {
      Some(JibriAction::Start) | Some(JibriAction::Stop) => {
        let occupant = self.find_occupant(from).await.ok_or((
          StanzaErrorKind::Forbidden,
          "not in the conference".to_owned(),
        ))?;
        match iq.action {
          Some(JibriAction::Start) => self.jibri.handle_start(&occupant, iq).await,
          _ => self.jibri.handle_stop(&occupant, iq).await,
        }
      },
      None => match self.jibri.handle_status_update(from, iq).await {
        None => Ok(JibriIq::default()),
        Some(kind) => Err((kind, "unknown jibri session".to_owned())),
      },
    }
  }

  async fn find_occupant(&self, from: &FullJid) -> Option<MucOccupant> {
    for occupant in self.room.occupants().await {
      if &occupant.occupant_jid == from || occupant.real_jid.as_ref() == Some(from) {
        return Some(occupant);
      }
    }
    None
  }

  /// Tears the conference down: terminate every session, expire every
  /// bridge, stop jibris and leave the room.
  pub async fn end_conference(self: &Arc<Self>, reason: Reason, text: &str) {
    let sessions: Vec<Arc<JingleSession>> = {
      let mut inner = self.inner.lock().await;
      if inner.ended {
        return;
      }
      inner.ended = true;
      inner
        .participants
        .values()
        .filter_map(|participant| participant.jingle_session.clone())
        .collect()
    };
    info!(room = %self.room.jid(), text, "ending conference");
    for session in sessions {
      self.jingle_registry.unregister(session.sid());
      let _ = session
        .terminate(reason.clone(), Some(text.to_owned()), true)
        .await;
    }
    self.jibri.stop_all().await;
    self.colibri.expire_all().await;
    if let Err(e) = self.room.leave().await {
      debug!("failed to leave MUC: {:?}", e);
    }
  }
}

#[async_trait]
impl JingleRequestHandler for JitsiConference {
  async fn handle_request(&self, remote: &FullJid, jingle: &Jingle) -> Option<StanzaErrorKind> {
    let conference = self.self_arc()?;
    let endpoint_id = remote.resource.clone();
    let jingle = jingle.clone();
    let result = self
      .queue
      .run(async move {
        match jingle.action {
          Action::SessionAccept => conference.on_session_accept(&endpoint_id, &jingle).await,
          Action::SourceAdd => conference.on_source_add(&endpoint_id, &jingle).await,
          Action::SourceRemove => conference.on_source_remove(&endpoint_id, &jingle).await,
          Action::SessionTerminate => conference.on_session_terminate(&endpoint_id).await,
          Action::SessionInfo
          | Action::TransportInfo
          | Action::TransportAccept
          | Action::TransportReject => None,
          _ => Some(StanzaErrorKind::FeatureNotImplemented),
        }
      })
      .await;
    match result {
      Ok(outcome) => outcome,
      Err(_) => Some(StanzaErrorKind::InternalServerError),
    }
  }
}

/// Bridges MUC callbacks onto the conference queue without keeping the
/// conference alive.
struct ConferenceMucHandler(Weak<JitsiConference>);

#[async_trait]
impl MucRoomHandler for ConferenceMucHandler {
  async fn occupant_joined(&self, occupant: MucOccupant) -> Result<()> {
    if let Some(conference) = self.0.upgrade() {
      let task_conference = conference.clone();
      conference
        .queue
        .enqueue(task_conference.handle_member_joined(occupant));
    }
    Ok(())
  }

  async fn occupant_presence_changed(&self, occupant: MucOccupant) -> Result<()> {
    if let Some(conference) = self.0.upgrade() {
      let task_conference = conference.clone();
      conference
        .queue
        .enqueue(task_conference.handle_member_presence(occupant));
    }
    Ok(())
  }

  async fn occupant_left(&self, occupant: MucOccupant) -> Result<()> {
    if let Some(conference) = self.0.upgrade() {
      let task_conference = conference.clone();
      conference
        .queue
        .enqueue(task_conference.handle_member_left(occupant));
    }
    Ok(())
  }
}
