use std::{
  collections::{BTreeMap, HashMap},
  fmt,
  sync::{Arc, Mutex, Weak},
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use jitsi_xmpp_parsers::{
  jingle::{Action, Content, Description, Jingle},
  json_message::JsonMessage,
  ns::JITSI_MEET,
};
use tracing::{debug, warn};
use xmpp_parsers::{
  iq::{Iq, IqType},
  jingle::{Reason, ReasonElement, SessionId},
  ns,
  BareJid, Element, FullJid, Jid,
};

use uuid::Uuid;

use crate::{
  error::StanzaErrorKind,
  source::{CompactSources, ConferenceSourceMap},
  xmpp::{
    connection::StanzaFilter,
    router::{unique_iq_id, IqResponse, IqSender},
  },
};

/// The life of one offer/answer exchange with a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JingleState {
  Idle,
  Inviting,
  Active,
  TransportPending,
  Terminated,
}

/// Where the conference receives the participant's answers and source
/// updates. Returning `None` acknowledges the request.
#[async_trait]
pub trait JingleRequestHandler: Send + Sync {
  async fn handle_request(&self, remote: &FullJid, jingle: &Jingle) -> Option<StanzaErrorKind>;
}

/// One Jingle session between the focus and a participant.
pub struct JingleSession {
  sid: SessionId,
  local_jid: FullJid,
  remote_jid: FullJid,
  room: BareJid,
  sender: Arc<dyn IqSender>,
  /// Send sources as compact JSON instead of inline contents.
  sources_as_json: bool,
  state: Mutex<JingleState>,
  handler: Weak<dyn JingleRequestHandler>,
}

impl fmt::Debug for JingleSession {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JingleSession")
      .field("sid", &self.sid.0)
      .field("remote", &self.remote_jid)
      .field("state", &*self.state.lock().unwrap())
      .finish()
  }
}

impl JingleSession {
  pub fn new(
    local_jid: FullJid,
    remote_jid: FullJid,
    sender: Arc<dyn IqSender>,
    handler: Weak<dyn JingleRequestHandler>,
    sources_as_json: bool,
  ) -> JingleSession {
    let room = BareJid::from(remote_jid.clone());
    JingleSession {
      sid: SessionId(Uuid::new_v4().to_string()),
      local_jid,
      remote_jid,
      room,
      sender,
      sources_as_json,
      state: Mutex::new(JingleState::Idle),
      handler,
    }
  }

  pub fn sid(&self) -> &str {
    &self.sid.0
  }

  pub fn remote_jid(&self) -> &FullJid {
    &self.remote_jid
  }

  pub fn state(&self) -> JingleState {
    *self.state.lock().unwrap()
  }

  fn set_state(&self, state: JingleState) {
    *self.state.lock().unwrap() = state;
  }

  fn embed_sources(&self, jingle: Jingle, sources: &ConferenceSourceMap) -> Jingle {
    if sources.is_empty() {
      return jingle;
    }
    if self.sources_as_json {
      let compact = CompactSources::from(sources);
      let mut jingle = jingle;
      match serde_json::to_string(&compact) {
        Ok(json) => jingle.other.push(JsonMessage::new(json).into()),
        Err(e) => warn!("failed to encode compact sources: {:?}", e),
      }
      jingle
    }
    else {
      let mut jingle = jingle;
      for source_content in sources.to_contents(Some(&self.room)) {
        if let Some(existing) = jingle
          .contents
          .iter_mut()
          .find(|content| content.name == source_content.name)
        {
          if let (
            Some(Description::Rtp(description)),
            Some(Description::Rtp(source_description)),
          ) = (&mut existing.description, &source_content.description)
          {
            description.ssrcs.extend(source_description.ssrcs.iter().cloned());
            description
              .ssrc_groups
              .extend(source_description.ssrc_groups.iter().cloned());
          }
        }
        else {
          jingle.contents.push(source_content);
        }
      }
      jingle
    }
  }

  async fn send_jingle_iq(&self, jingle: Jingle) -> Result<IqResponse> {
    let iq = Iq::from_set(unique_iq_id(), jingle)
      .with_to(Jid::Full(self.remote_jid.clone()))
      .with_from(Jid::Full(self.local_jid.clone()));
    self.sender.send_iq(iq).await
  }

  async fn send_jingle_fire_and_forget(&self, jingle: Jingle) -> Result<()> {
    let iq = Iq::from_set(unique_iq_id(), jingle)
      .with_to(Jid::Full(self.remote_jid.clone()))
      .with_from(Jid::Full(self.local_jid.clone()));
    self.sender.send_stanza(iq.into()).await
  }

  /// Sends session-initiate with the given offer and the conference's
  /// current sources. The session stays Inviting until the participant's
  /// session-accept arrives.
  #[tracing::instrument(level = "debug", skip(contents, sources), err)]
  pub async fn initiate(
    &self,
    contents: Vec<Content>,
    sources: &ConferenceSourceMap,
  ) -> Result<()> {
    if self.state() != JingleState::Idle {
      bail!("session-initiate in state {:?}", self.state());
    }
    let mut jingle = Jingle::new(Action::SessionInitiate, self.sid.clone())
      .with_initiator(Jid::Full(self.local_jid.clone()))
      .with_responder(Jid::Full(self.remote_jid.clone()));
    jingle.contents = contents;
    let jingle = self.embed_sources(jingle, sources);
    self.set_state(JingleState::Inviting);
    match self.send_jingle_iq(jingle).await {
      Ok(IqResponse::Result(_)) => Ok(()),
      Ok(IqResponse::Error(error)) => {
        self.set_state(JingleState::Terminated);
        bail!("session-initiate rejected: {:?}", error.defined_condition)
      },
      Err(e) => {
        self.set_state(JingleState::Terminated);
        Err(e)
      },
    }
  }

  /// Sends transport-replace with the new transport and a full resend of
  /// sources. A null or timed-out response is a failure and the caller
  /// escalates to terminate-and-reinvite.
  #[tracing::instrument(level = "debug", skip(contents, sources), err)]
  pub async fn replace_transport(
    &self,
    contents: Vec<Content>,
    sources: &ConferenceSourceMap,
  ) -> Result<()> {
    if self.state() != JingleState::Active {
      bail!("transport-replace in state {:?}", self.state());
    }
    let mut jingle = Jingle::new(Action::TransportReplace, self.sid.clone())
      .with_initiator(Jid::Full(self.local_jid.clone()));
    jingle.contents = contents;
    let jingle = self.embed_sources(jingle, sources);
    self.set_state(JingleState::TransportPending);
    match self.send_jingle_iq(jingle).await {
      Ok(IqResponse::Result(_)) => {
        self.set_state(JingleState::Active);
        Ok(())
      },
      Ok(IqResponse::Error(error)) => {
        bail!("transport-replace rejected: {:?}", error.defined_condition)
      },
      Err(e) => Err(e),
    }
  }

  /// Fire-and-forget source-add.
  pub async fn add_source(&self, sources: &ConferenceSourceMap) -> Result<()> {
    let jingle = Jingle::new(Action::SourceAdd, self.sid.clone());
    let jingle = self.embed_sources(jingle, sources);
    self.send_jingle_fire_and_forget(jingle).await
  }

  /// Fire-and-forget source-remove.
  pub async fn remove_source(&self, sources: &ConferenceSourceMap) -> Result<()> {
    let jingle = Jingle::new(Action::SourceRemove, self.sid.clone());
    let jingle = self.embed_sources(jingle, sources);
    self.send_jingle_fire_and_forget(jingle).await
  }

  /// Ends the session, optionally telling the participant why.
  #[tracing::instrument(level = "debug", err)]
  pub async fn terminate(
    &self,
    reason: Reason,
    text: Option<String>,
    send_terminate: bool,
  ) -> Result<()> {
    if self.state() == JingleState::Terminated {
      return Ok(());
    }
    self.set_state(JingleState::Terminated);
    if send_terminate {
      let mut texts = BTreeMap::new();
      if let Some(text) = text {
        texts.insert(String::new(), text);
      }
      let jingle = Jingle::new(Action::SessionTerminate, self.sid.clone())
        .set_reason(ReasonElement { reason, texts });
      self.send_jingle_fire_and_forget(jingle).await?;
    }
    Ok(())
  }

  /// Applies an inbound action to the state machine and forwards it to the
  /// conference. Actions that do not fit the current state are answered
  /// with feature-not-implemented.
  pub async fn process_inbound(&self, jingle: &Jingle) -> Option<StanzaErrorKind> {
    let state = self.state();
    let accepted = match (jingle.action, state) {
      (Action::SessionAccept, JingleState::Inviting) => true,
      (Action::SessionTerminate, s) if s != JingleState::Terminated => true,
      (Action::TransportAccept, JingleState::TransportPending) => true,
      (Action::TransportReject, JingleState::TransportPending) => true,
      (
        Action::SessionInfo | Action::TransportInfo,
        JingleState::Inviting | JingleState::Active | JingleState::TransportPending,
      ) => true,
      (Action::SourceAdd | Action::SourceRemove, JingleState::Active) => true,
      _ => false,
    };
    if !accepted {
      debug!(
        action = %jingle.action,
        ?state,
        "jingle action does not fit the session state"
      );
      return Some(StanzaErrorKind::FeatureNotImplemented);
    }
    if let Some(handler) = self.handler.upgrade() {
      if let Some(error) = handler.handle_request(&self.remote_jid, jingle).await {
        return Some(error);
      }
    }
    else {
      return Some(StanzaErrorKind::ItemNotFound);
    }
    match jingle.action {
      Action::SessionAccept => self.set_state(JingleState::Active),
      Action::SessionTerminate => self.set_state(JingleState::Terminated),
      Action::TransportAccept | Action::TransportReject => self.set_state(JingleState::Active),
      _ => {},
    }
    None
  }

  /// The sources carried by an inbound Jingle, inline or as compact JSON.
  pub fn extract_sources(&self, endpoint_id: &str, jingle: &Jingle) -> ConferenceSourceMap {
    let inline = ConferenceSourceMap::from_contents(endpoint_id, &jingle.contents);
    if !inline.is_empty() {
      return inline;
    }
    for payload in &jingle.other {
      if payload.is("json-message", JITSI_MEET) {
        if let Ok(message) = JsonMessage::try_from(payload.clone()) {
          match serde_json::from_str::<CompactSources>(&message.json) {
            Ok(compact) => {
              let map = ConferenceSourceMap::from(&compact);
              // Compact payloads from a participant describe that
              // participant only.
              if let Some(set) = map.get(endpoint_id).cloned().or_else(|| {
                map.0.values().next().cloned()
              }) {
                return ConferenceSourceMap::of_endpoint(endpoint_id, set);
              }
            },
            Err(e) => warn!("failed to parse compact sources: {:?}", e),
          }
        }
      }
    }
    ConferenceSourceMap::new()
  }
}

/// Sessions are owned by their participant; the registry only hands out a
/// reference while one still exists. A sid being re-registered evicts the
/// stale entry with a warning.
#[derive(Clone, Default)]
pub struct JingleSessionRegistry {
  sessions: Arc<Mutex<HashMap<String, Weak<JingleSession>>>>,
}

impl JingleSessionRegistry {
  pub fn new() -> JingleSessionRegistry {
    Default::default()
  }

  pub fn register(&self, session: &Arc<JingleSession>) {
    let mut sessions = self.sessions.lock().unwrap();
    if let Some(previous) = sessions.insert(session.sid().to_owned(), Arc::downgrade(session)) {
      if previous.upgrade().is_some() {
        warn!(sid = session.sid(), "evicting a live session with the same sid");
      }
    }
  }

  pub fn unregister(&self, sid: &str) {
    self.sessions.lock().unwrap().remove(sid);
  }

  pub fn get(&self, sid: &str) -> Option<Arc<JingleSession>> {
    let mut sessions = self.sessions.lock().unwrap();
    match sessions.get(sid) {
      Some(weak) => match weak.upgrade() {
        Some(session) => Some(session),
        None => {
          sessions.remove(sid);
          None
        },
      },
      None => None,
    }
  }
}

/// Routes inbound Jingle IQs to their session and answers them.
#[derive(Clone)]
pub struct JingleIqHandler {
  local_jid: FullJid,
  registry: JingleSessionRegistry,
  sender: Arc<dyn IqSender>,
}

impl JingleIqHandler {
  pub fn new(
    local_jid: FullJid,
    registry: JingleSessionRegistry,
    sender: Arc<dyn IqSender>,
  ) -> JingleIqHandler {
    JingleIqHandler {
      local_jid,
      registry,
      sender,
    }
  }

  async fn respond(&self, to: Jid, id: String, error: Option<(StanzaErrorKind, &str)>) -> Result<()> {
    let iq = match error {
      None => Iq::empty_result(to, id).with_from(Jid::Full(self.local_jid.clone())),
      Some((kind, text)) => Iq::from_error(id, kind.to_stanza_error(text))
        .with_to(to)
        .with_from(Jid::Full(self.local_jid.clone())),
    };
    self.sender.send_stanza(iq.into()).await
  }
}

#[async_trait]
impl StanzaFilter for JingleIqHandler {
  fn name(&self) -> &'static str {
    "jingle-iq"
  }

  fn filter(&self, element: &Element) -> bool {
    element.is("iq", ns::DEFAULT_NS)
      && element.attr("type") == Some("set")
      && element
        .children()
        .any(|child| child.is("jingle", ns::JINGLE))
  }

  async fn take(&self, element: Element) -> Result<()> {
    // Processing can await further IQ round-trips, which arrive on the
    // thread running this filter. Hand off so the stream never waits on
    // itself.
    let handler = self.clone();
    tokio::spawn(async move {
      if let Err(e) = handler.process(element).await {
        warn!("jingle IQ processing failed: {:?}", e);
      }
    });
    Ok(())
  }
}

impl JingleIqHandler {
  async fn process(&self, element: Element) -> Result<()> {
    let iq = Iq::try_from(element)?;
    let from = match iq.from.clone() {
      Some(Jid::Full(from)) => from,
      _ => {
        debug!("jingle IQ without a full from jid, dropping");
        return Ok(());
      },
    };
    let reply_to = Jid::Full(from.clone());
    let payload = match iq.payload {
      IqType::Set(payload) => payload,
      _ => return Ok(()),
    };
    let jingle = match Jingle::try_from(payload) {
      Ok(jingle) => jingle,
      Err(e) => {
        debug!("malformed jingle IQ: {:?}", e);
        return self
          .respond(reply_to, iq.id, Some((StanzaErrorKind::BadRequest, "malformed jingle")))
          .await;
      },
    };
    let session = match self.registry.get(&jingle.sid.0) {
      Some(session) => session,
      None => {
        return self
          .respond(reply_to, iq.id, Some((StanzaErrorKind::BadRequest, "unknown session")))
          .await;
      },
    };
    if session.remote_jid() != &from {
      return self
        .respond(
          reply_to,
          iq.id,
          Some((StanzaErrorKind::BadRequest, "session belongs to another occupant")),
        )
        .await;
    }
    match session.process_inbound(&jingle).await {
      None => self.respond(reply_to, iq.id, None).await,
      Some(kind) => {
        self
          .respond(reply_to, iq.id, Some((kind, "jingle request failed")))
          .await
      },
    }
  }
}
