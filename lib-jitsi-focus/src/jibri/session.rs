use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
  time::Duration,
};

use anyhow::Result;
use jitsi_xmpp_parsers::{
  jibri_iq::{FailureReason, JibriAction, JibriIq, JibriStatus, RecordingMode},
  jibri_status::{RecordingStatus, SipCallState},
};
use tokio::time;
use tracing::{debug, info, warn};
use xmpp_parsers::{iq::Iq, BareJid, FullJid, Jid};

use uuid::Uuid;

use crate::{
  error::StanzaErrorKind,
  jibri::JibriDetector,
  stats::FocusStats,
  xmpp::{
    muc::{MucOccupant, MucRoom},
    router::{unique_iq_id, IqResponse, IqSender},
  },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JibriRole {
  Recording,
  LiveStreaming,
  SipGateway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JibriSessionState {
  Pending,
  On,
  Off,
}

/// A validated start request.
#[derive(Debug, Clone)]
pub struct JibriRequest {
  pub role: JibriRole,
  pub recording_mode: RecordingMode,
  pub stream_id: Option<String>,
  pub youtube_broadcast_id: Option<String>,
  pub sip_address: Option<String>,
  pub display_name: Option<String>,
}

impl JibriRequest {
  /// Checks the stream-id / recording-mode / SIP address combinations the
  /// protocol allows.
  pub fn from_iq(iq: &JibriIq) -> Result<JibriRequest, (StanzaErrorKind, &'static str)> {
    if let Some(sip_address) = &iq.sip_address {
      if sip_address.is_empty() {
        return Err((StanzaErrorKind::BadRequest, "empty SIP address"));
      }
      return Ok(JibriRequest {
        role: JibriRole::SipGateway,
        recording_mode: RecordingMode::Stream,
        stream_id: None,
        youtube_broadcast_id: None,
        sip_address: Some(sip_address.clone()),
        display_name: iq.display_name.clone(),
      });
    }
    let mode = iq.recording_mode.unwrap_or(RecordingMode::File);
    match mode {
      RecordingMode::Stream => {
        if iq.stream_id.as_deref().unwrap_or("").is_empty() {
          return Err((
            StanzaErrorKind::BadRequest,
            "stream-id is required for live streaming",
          ));
        }
      },
      RecordingMode::File => {
        if iq.stream_id.is_some() {
          return Err((
            StanzaErrorKind::BadRequest,
            "stream-id must be absent when recording to a file",
          ));
        }
      },
    }
    Ok(JibriRequest {
      role: match mode {
        RecordingMode::File => JibriRole::Recording,
        RecordingMode::Stream => JibriRole::LiveStreaming,
      },
      recording_mode: mode,
      stream_id: iq.stream_id.clone(),
      youtube_broadcast_id: iq.youtube_broadcast_id.clone(),
      sip_address: None,
      display_name: iq.display_name.clone(),
    })
  }
}

struct SessionState {
  state: JibriSessionState,
  jibri_jid: Option<FullJid>,
  attempts: u32,
  /// Bumped whenever the attempt changes, so a stale pending watchdog can
  /// tell it lost.
  attempt_seq: u64,
  failure: Option<FailureReason>,
}

/// One recorder, live-stream or SIP call driven by a Jibri worker.
pub struct JibriSession {
  pub session_id: String,
  pub role: JibriRole,
  pub request: JibriRequest,
  room: BareJid,
  state: Mutex<SessionState>,
}

impl JibriSession {
  fn new(room: BareJid, request: JibriRequest) -> Arc<JibriSession> {
    Arc::new(JibriSession {
      session_id: Uuid::new_v4().to_string(),
      role: request.role,
      request,
      room,
      state: Mutex::new(SessionState {
        state: JibriSessionState::Pending,
        jibri_jid: None,
        attempts: 0,
        attempt_seq: 0,
        failure: None,
      }),
    })
  }

  pub fn state(&self) -> JibriSessionState {
    self.state.lock().unwrap().state
  }

  fn status(&self) -> JibriStatus {
    match self.state() {
      JibriSessionState::Pending => JibriStatus::Pending,
      JibriSessionState::On => JibriStatus::On,
      JibriSessionState::Off => JibriStatus::Off,
    }
  }
}

/// Dispatches Jibri sessions for one conference: at most one recorder or
/// live-streamer, and one SIP gateway session per SIP address.
pub struct JibriConferenceDispatcher {
  detector: JibriDetector,
  sender: Arc<dyn IqSender>,
  local_jid: FullJid,
  muc: MucRoom,
  pending_timeout: Duration,
  num_retries: u32,
  stats: Arc<FocusStats>,
  recording: Mutex<Option<Arc<JibriSession>>>,
  sip_calls: Mutex<HashMap<String, Arc<JibriSession>>>,
}

impl JibriConferenceDispatcher {
  pub fn new(
    detector: JibriDetector,
    sender: Arc<dyn IqSender>,
    local_jid: FullJid,
    muc: MucRoom,
    pending_timeout: Duration,
    num_retries: u32,
    stats: Arc<FocusStats>,
  ) -> Arc<JibriConferenceDispatcher> {
    Arc::new(JibriConferenceDispatcher {
      detector,
      sender,
      local_jid,
      muc,
      pending_timeout,
      num_retries,
      stats,
      recording: Mutex::new(None),
      sip_calls: Mutex::new(HashMap::new()),
    })
  }

  fn start_iq(&self, session: &JibriSession, jibri: &FullJid) -> Iq {
    let request = &session.request;
    let payload = JibriIq {
      action: Some(JibriAction::Start),
      recording_mode: Some(request.recording_mode),
      room: Some(session.room.clone()),
      session_id: Some(session.session_id.clone()),
      stream_id: request.stream_id.clone(),
      youtube_broadcast_id: request.youtube_broadcast_id.clone(),
      sip_address: request.sip_address.clone(),
      display_name: request.display_name.clone(),
      ..Default::default()
    };
    Iq::from_set(unique_iq_id(), payload)
      .with_to(Jid::Full(jibri.clone()))
      .with_from(Jid::Full(self.local_jid.clone()))
  }

  async fn publish_status(&self, session: &JibriSession) {
    let failure = session.state.lock().unwrap().failure;
    let extension = match session.role {
      JibriRole::Recording | JibriRole::LiveStreaming => RecordingStatus {
        status: session.status(),
        mode: session.request.recording_mode,
        session_id: Some(session.session_id.clone()),
        failure_reason: failure,
      }
      .into(),
      JibriRole::SipGateway => SipCallState {
        status: session.status(),
        sip_address: session.request.sip_address.clone().unwrap_or_default(),
        session_id: Some(session.session_id.clone()),
        failure_reason: failure,
      }
      .into(),
    };
    if let Err(e) = self.muc.update_presence_extension(extension).await {
      warn!("failed to publish jibri status: {:?}", e);
    }
  }

  /// Sends a start to a freshly-selected instance. Returns false when no
  /// instance could take the session.
  async fn try_start_attempt(self: &Arc<Self>, session: &Arc<JibriSession>) -> bool {
    let jibri = match self.detector.select() {
      Some(jibri) => jibri,
      None => return false,
    };
    let iq = self.start_iq(session, &jibri);
    match self.sender.send_iq(iq).await {
      Ok(IqResponse::Result(_)) => {
        let seq = {
          let mut state = session.state.lock().unwrap();
          state.jibri_jid = Some(jibri.clone());
          state.state = JibriSessionState::Pending;
          state.attempt_seq += 1;
          state.attempt_seq
        };
        info!(session_id = session.session_id.as_str(), jibri = %jibri, "jibri start sent");
        self.spawn_pending_watchdog(session.clone(), seq);
        true
      },
      Ok(IqResponse::Error(error)) => {
        warn!(jibri = %jibri, "jibri rejected start: {:?}", error.defined_condition);
        FocusStats::bump(&self.stats.jibri_failures);
        self.detector.instance_failed(&jibri.to_string());
        false
      },
      Err(e) => {
        warn!(jibri = %jibri, "jibri start failed: {:?}", e);
        FocusStats::bump(&self.stats.jibri_failures);
        self.detector.instance_failed(&jibri.to_string());
        false
      },
    }
  }

  fn spawn_pending_watchdog(self: &Arc<Self>, session: Arc<JibriSession>, seq: u64) {
    let dispatcher = self.clone();
    tokio::spawn(async move {
      time::sleep(dispatcher.pending_timeout).await;
      let stale = {
        let state = session.state.lock().unwrap();
        state.state != JibriSessionState::Pending || state.attempt_seq != seq
      };
      if stale {
        return;
      }
      warn!(
        session_id = session.session_id.as_str(),
        "jibri stayed pending too long"
      );
      FocusStats::bump(&dispatcher.stats.jibri_failures);
      let failed_jibri = session.state.lock().unwrap().jibri_jid.clone();
      if let Some(jibri) = failed_jibri {
        dispatcher.detector.instance_failed(&jibri.to_string());
      }
      dispatcher.retry_or_give_up(&session).await;
    });
  }

  async fn retry_or_give_up(self: &Arc<Self>, session: &Arc<JibriSession>) {
    let attempts = {
      let mut state = session.state.lock().unwrap();
      state.attempts += 1;
      state.attempts
    };
    if attempts <= self.num_retries && self.try_start_attempt(session).await {
      return;
    }
    info!(
      session_id = session.session_id.as_str(),
      attempts, "giving up on jibri session"
    );
    {
      let mut state = session.state.lock().unwrap();
      state.state = JibriSessionState::Off;
      state.failure = Some(FailureReason::Error);
      state.attempt_seq += 1;
    }
    self.clear_session(session);
    self.publish_status(session).await;
  }

  fn clear_session(&self, session: &Arc<JibriSession>) {
    match session.role {
      JibriRole::Recording | JibriRole::LiveStreaming => {
        let mut recording = self.recording.lock().unwrap();
        if recording
          .as_ref()
          .map(|active| active.session_id == session.session_id)
          .unwrap_or_default()
        {
          *recording = None;
        }
      },
      JibriRole::SipGateway => {
        if let Some(address) = &session.request.sip_address {
          self.sip_calls.lock().unwrap().remove(address);
        }
      },
    }
  }

  /// A moderator asked for a recorder, live stream or SIP call.
  pub async fn handle_start(
    self: &Arc<Self>,
    from: &MucOccupant,
    iq: &JibriIq,
  ) -> Result<JibriIq, (StanzaErrorKind, String)> {
    if !from.is_moderator() {
      return Err((
        StanzaErrorKind::Forbidden,
        "only moderators may control recording".to_owned(),
      ));
    }
    let request = JibriRequest::from_iq(iq).map_err(|(kind, text)| (kind, text.to_owned()))?;

    match request.role {
      JibriRole::Recording | JibriRole::LiveStreaming => {
        if self.recording.lock().unwrap().is_some() {
          return Err((
            StanzaErrorKind::UnexpectedRequest,
            "a recording session is already active".to_owned(),
          ));
        }
      },
      JibriRole::SipGateway => {
        let address = request.sip_address.clone().unwrap_or_default();
        if self.sip_calls.lock().unwrap().contains_key(&address) {
          return Err((
            StanzaErrorKind::UnexpectedRequest,
            "a SIP session for this address is already active".to_owned(),
          ));
        }
      },
    }

    if !self.detector.has_instances() {
      return Err((
        StanzaErrorKind::ServiceUnavailable,
        "no Jibris available".to_owned(),
      ));
    }

    let session = JibriSession::new(self.muc.jid().clone(), request);
    if !self.try_start_attempt(&session).await {
      return Err((
        StanzaErrorKind::ResourceConstraint,
        "all Jibris are busy".to_owned(),
      ));
    }

    match session.role {
      JibriRole::Recording | JibriRole::LiveStreaming => {
        *self.recording.lock().unwrap() = Some(session.clone());
      },
      JibriRole::SipGateway => {
        if let Some(address) = &session.request.sip_address {
          self
            .sip_calls
            .lock()
            .unwrap()
            .insert(address.clone(), session.clone());
        }
      },
    }
    self.publish_status(&session).await;

    Ok(JibriIq {
      status: Some(JibriStatus::Pending),
      session_id: Some(session.session_id.clone()),
      ..Default::default()
    })
  }

  fn find_session(&self, iq: &JibriIq) -> Option<Arc<JibriSession>> {
    if let Some(address) = &iq.sip_address {
      return self.sip_calls.lock().unwrap().get(address).cloned();
    }
    if let Some(session_id) = &iq.session_id {
      let recording = self.recording.lock().unwrap();
      if let Some(session) = recording
        .as_ref()
        .filter(|session| &session.session_id == session_id)
      {
        return Some(session.clone());
      }
      drop(recording);
      return self
        .sip_calls
        .lock()
        .unwrap()
        .values()
        .find(|session| &session.session_id == session_id)
        .cloned();
    }
    self.recording.lock().unwrap().clone()
  }

  /// A moderator asked to stop a session.
  pub async fn handle_stop(
    self: &Arc<Self>,
    from: &MucOccupant,
    iq: &JibriIq,
  ) -> Result<JibriIq, (StanzaErrorKind, String)> {
    if !from.is_moderator() {
      return Err((
        StanzaErrorKind::Forbidden,
        "only moderators may control recording".to_owned(),
      ));
    }
    let session = self.find_session(iq).ok_or((
      StanzaErrorKind::ItemNotFound,
      "no active session".to_owned(),
    ))?;
    let jibri = {
      let mut state = session.state.lock().unwrap();
      state.state = JibriSessionState::Off;
      state.attempt_seq += 1;
      state.jibri_jid.clone()
    };
    if let Some(jibri) = jibri {
      let payload = JibriIq {
        action: Some(JibriAction::Stop),
        session_id: Some(session.session_id.clone()),
        ..Default::default()
      };
      let stop = Iq::from_set(unique_iq_id(), payload)
        .with_to(Jid::Full(jibri))
        .with_from(Jid::Full(self.local_jid.clone()));
      if let Err(e) = self.sender.send_stanza(stop.into()).await {
        warn!("failed to send jibri stop: {:?}", e);
      }
    }
    self.clear_session(&session);
    self.publish_status(&session).await;
    Ok(JibriIq {
      status: Some(JibriStatus::Off),
      session_id: Some(session.session_id.clone()),
      ..Default::default()
    })
  }

  /// A status update pushed by the Jibri instance itself.
  pub async fn handle_status_update(
    self: &Arc<Self>,
    from: &FullJid,
    iq: &JibriIq,
  ) -> Option<StanzaErrorKind> {
    let session = match self.find_session(iq) {
      Some(session) => session,
      None => {
        debug!(from = %from, "jibri status for an unknown session");
        return Some(StanzaErrorKind::ItemNotFound);
      },
    };
    match iq.status {
      Some(JibriStatus::On) => {
        {
          let mut state = session.state.lock().unwrap();
          state.state = JibriSessionState::On;
          state.failure = None;
          state.attempt_seq += 1;
        }
        info!(session_id = session.session_id.as_str(), "jibri session is on");
        self.publish_status(&session).await;
        None
      },
      Some(JibriStatus::Off) => {
        if let Some(reason) = iq.failure_reason {
          FocusStats::bump(&self.stats.jibri_failures);
          self.detector.instance_failed(&from.to_string());
          {
            let mut state = session.state.lock().unwrap();
            state.failure = Some(reason);
            state.attempt_seq += 1;
          }
          if iq.should_retry.unwrap_or(true) {
            self.retry_or_give_up(&session).await;
            return None;
          }
        }
        {
          let mut state = session.state.lock().unwrap();
          state.state = JibriSessionState::Off;
          state.attempt_seq += 1;
        }
        self.clear_session(&session);
        self.publish_status(&session).await;
        None
      },
      Some(JibriStatus::Pending) | None => None,
    }
  }

  /// Stops everything, for conference teardown.
  pub async fn stop_all(self: &Arc<Self>) {
    let sessions: Vec<Arc<JibriSession>> = {
      let recording = self.recording.lock().unwrap().clone();
      let sip: Vec<_> = self.sip_calls.lock().unwrap().values().cloned().collect();
      recording.into_iter().chain(sip).collect()
    };
    for session in sessions {
      let jibri = {
        let mut state = session.state.lock().unwrap();
        state.state = JibriSessionState::Off;
        state.attempt_seq += 1;
        state.jibri_jid.clone()
      };
      if let Some(jibri) = jibri {
        let payload = JibriIq {
          action: Some(JibriAction::Stop),
          session_id: Some(session.session_id.clone()),
          ..Default::default()
        };
        let stop = Iq::from_set(unique_iq_id(), payload)
          .with_to(Jid::Full(jibri))
          .with_from(Jid::Full(self.local_jid.clone()));
        let _ = self.sender.send_stanza(stop.into()).await;
      }
      self.clear_session(&session);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::MockSender;
  use xmpp_parsers::{
    muc::user::{Affiliation, Role},
    Element,
  };

  fn moderator() -> MucOccupant {
    MucOccupant {
      occupant_jid: "r1@conference.example.com/mod1".parse().unwrap(),
      real_jid: None,
      role: Role::Moderator,
      affiliation: Affiliation::Owner,
      payloads: vec![],
    }
  }

  fn guest() -> MucOccupant {
    MucOccupant {
      occupant_jid: "r1@conference.example.com/guest1".parse().unwrap(),
      real_jid: None,
      role: Role::Participant,
      affiliation: Affiliation::None,
      payloads: vec![],
    }
  }

  fn jibri_jid(name: &str) -> FullJid {
    format!("jibribrewery@internal.example.com/{}", name)
      .parse()
      .unwrap()
  }

  fn dispatcher(
    sender: Arc<MockSender>,
    detector: JibriDetector,
    pending_timeout: Duration,
    num_retries: u32,
  ) -> Arc<JibriConferenceDispatcher> {
    let muc = MucRoom::new(
      sender.clone(),
      "r1@conference.example.com".parse().unwrap(),
      "focus",
    );
    JibriConferenceDispatcher::new(
      detector,
      sender,
      "focus@auth.example.com/focus".parse().unwrap(),
      muc,
      pending_timeout,
      num_retries,
      FocusStats::new(),
    )
  }

  fn file_start() -> JibriIq {
    JibriIq {
      action: Some(JibriAction::Start),
      recording_mode: Some(RecordingMode::File),
      ..Default::default()
    }
  }

  fn count_recording_status(sender: &MockSender) -> usize {
    sender
      .sent_stanzas()
      .iter()
      .filter(|stanza| {
        stanza.name() == "presence"
          && stanza
            .children()
            .any(|child| child.name() == "jibri-recording-status")
      })
      .count()
  }

  #[tokio::test]
  async fn start_from_non_moderator_is_forbidden() {
    let sender = Arc::new(MockSender::new());
    let detector = JibriDetector::new();
    detector.update(jibri_jid("j1"), true);
    let dispatcher = dispatcher(sender.clone(), detector, Duration::from_secs(5), 1);
    let result = dispatcher.handle_start(&guest(), &file_start()).await;
    assert_eq!(result.unwrap_err().0, StanzaErrorKind::Forbidden);
    // No state was touched and nothing went out.
    assert_eq!(sender.sent_count(), 0);
  }

  #[tokio::test]
  async fn start_without_instances_is_service_unavailable() {
    let sender = Arc::new(MockSender::new());
    let dispatcher = dispatcher(sender, JibriDetector::new(), Duration::from_secs(5), 1);
    let result = dispatcher.handle_start(&moderator(), &file_start()).await;
    let (kind, text) = result.unwrap_err();
    assert_eq!(kind, StanzaErrorKind::ServiceUnavailable);
    assert!(text.contains("no Jibris"));
  }

  #[tokio::test]
  async fn stream_mode_requires_stream_id() {
    let sender = Arc::new(MockSender::new());
    let detector = JibriDetector::new();
    detector.update(jibri_jid("j1"), true);
    let dispatcher = dispatcher(sender, detector, Duration::from_secs(5), 1);
    let iq = JibriIq {
      action: Some(JibriAction::Start),
      recording_mode: Some(RecordingMode::Stream),
      ..Default::default()
    };
    let result = dispatcher.handle_start(&moderator(), &iq).await;
    assert_eq!(result.unwrap_err().0, StanzaErrorKind::BadRequest);
  }

  #[tokio::test]
  async fn file_mode_rejects_stream_id() {
    let sender = Arc::new(MockSender::new());
    let detector = JibriDetector::new();
    detector.update(jibri_jid("j1"), true);
    let dispatcher = dispatcher(sender, detector, Duration::from_secs(5), 1);
    let iq = JibriIq {
      action: Some(JibriAction::Start),
      recording_mode: Some(RecordingMode::File),
      stream_id: Some("rtmp://example/live".to_owned()),
      ..Default::default()
    };
    let result = dispatcher.handle_start(&moderator(), &iq).await;
    assert_eq!(result.unwrap_err().0, StanzaErrorKind::BadRequest);
  }

  #[tokio::test]
  async fn second_recording_is_unexpected() {
    let sender = Arc::new(MockSender::new());
    let detector = JibriDetector::new();
    detector.update(jibri_jid("j1"), true);
    detector.update(jibri_jid("j2"), true);
    let dispatcher = dispatcher(sender, detector, Duration::from_secs(5), 1);
    dispatcher.handle_start(&moderator(), &file_start()).await.unwrap();
    let result = dispatcher.handle_start(&moderator(), &file_start()).await;
    assert_eq!(result.unwrap_err().0, StanzaErrorKind::UnexpectedRequest);
  }

  #[tokio::test]
  async fn stop_without_session_is_item_not_found() {
    let sender = Arc::new(MockSender::new());
    let detector = JibriDetector::new();
    detector.update(jibri_jid("j1"), true);
    let dispatcher = dispatcher(sender, detector, Duration::from_secs(5), 1);
    let result = dispatcher
      .handle_stop(&moderator(), &JibriIq::default())
      .await;
    assert_eq!(result.unwrap_err().0, StanzaErrorKind::ItemNotFound);
  }

  #[tokio::test(start_paused = true)]
  async fn pending_timeout_retries_with_a_fresh_instance() {
    let sender = Arc::new(MockSender::new());
    let detector = JibriDetector::new();
    detector.update(jibri_jid("j1"), true);
    detector.update(jibri_jid("j2"), true);
    let dispatcher = dispatcher(
      sender.clone(),
      detector.clone(),
      Duration::from_secs(5),
      1,
    );
    let result = dispatcher
      .handle_start(&moderator(), &file_start())
      .await
      .unwrap();
    assert_eq!(result.status, Some(JibriStatus::Pending));
    assert_eq!(count_recording_status(&sender), 1);

    // No ON within the pending timeout: the watchdog rotates instances.
    time::sleep(Duration::from_secs(6)).await;
    let starts: Vec<Element> = sender
      .sent_stanzas()
      .into_iter()
      .filter(|stanza| {
        stanza.name() == "iq"
          && stanza
            .children()
            .any(|child| child.name() == "jibri" && child.attr("action") == Some("start"))
      })
      .collect();
    assert_eq!(starts.len(), 2);
    assert_ne!(starts[0].attr("to"), starts[1].attr("to"));

    // The second instance comes up.
    let on = JibriIq {
      status: Some(JibriStatus::On),
      session_id: result.session_id.clone(),
      ..Default::default()
    };
    dispatcher
      .handle_status_update(&jibri_jid("j2"), &on)
      .await;
    assert_eq!(count_recording_status(&sender), 2);
  }

  #[tokio::test]
  async fn sip_sessions_are_keyed_by_address() {
    let sender = Arc::new(MockSender::new());
    let detector = JibriDetector::new();
    detector.update(jibri_jid("j1"), true);
    detector.update(jibri_jid("j2"), true);
    let dispatcher = dispatcher(sender.clone(), detector, Duration::from_secs(5), 1);
    let sip = |address: &str| JibriIq {
      action: Some(JibriAction::Start),
      sip_address: Some(address.to_owned()),
      ..Default::default()
    };
    dispatcher.handle_start(&moderator(), &sip("a@sip.example.com")).await.unwrap();
    // A different address may run concurrently, but needs its instance to
    // clear the selection spread first.
    tokio::time::sleep(crate::jibri::SELECT_TIMEOUT).await;
    dispatcher.handle_start(&moderator(), &sip("b@sip.example.com")).await.unwrap();
    let result = dispatcher.handle_start(&moderator(), &sip("a@sip.example.com")).await;
    assert_eq!(result.unwrap_err().0, StanzaErrorKind::UnexpectedRequest);
  }
}
