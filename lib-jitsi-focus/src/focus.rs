use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use jitsi_xmpp_parsers::{jibri_iq::JibriIq, ns::JIBRI};
use serde::Serialize;
use tracing::{debug, info, warn};
use xmpp_parsers::{
  iq::{Iq, IqType},
  ns,
  BareJid, Element, FullJid, Jid,
};

use uuid::Uuid;

use crate::{
  auth::AuthenticationAuthority,
  bridge::{selector::BridgeSelector, BridgeRegistry},
  colibri::ColibriSessionManager,
  conference::JitsiConference,
  config::FocusConfig,
  error::StanzaErrorKind,
  jibri::JibriDetector,
  jingle::JingleSessionRegistry,
  stats::FocusStats,
  xmpp::{connection::StanzaFilter, router::IqSender},
};

/// A point-in-time view for the health endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FocusHealth {
  pub operational_bridges: usize,
  pub conferences: usize,
}

impl FocusHealth {
  pub fn healthy(&self) -> bool {
    self.operational_bridges > 0
  }
}

/// Process-level services: the conference store and everything shared
/// between conferences.
pub struct FocusManager {
  config: FocusConfig,
  sender: Arc<dyn IqSender>,
  focus_jid: FullJid,
  bridge_registry: BridgeRegistry,
  jibri_detector: JibriDetector,
  auth: Arc<AuthenticationAuthority>,
  jingle_registry: JingleSessionRegistry,
  stats: Arc<FocusStats>,
  conferences: tokio::sync::Mutex<HashMap<BareJid, Arc<JitsiConference>>>,
}

impl FocusManager {
  pub fn new(
    config: FocusConfig,
    sender: Arc<dyn IqSender>,
    focus_jid: FullJid,
    stats: Arc<FocusStats>,
  ) -> Arc<FocusManager> {
    let bridge_registry = BridgeRegistry::new(&config);
    let auth = AuthenticationAuthority::new(&config);
    auth.start_expiry_sweep();
    Arc::new(FocusManager {
      bridge_registry,
      jibri_detector: JibriDetector::new(),
      auth,
      jingle_registry: JingleSessionRegistry::new(),
      stats,
      conferences: tokio::sync::Mutex::new(HashMap::new()),
      config,
      sender,
      focus_jid,
    })
  }

  pub fn config(&self) -> &FocusConfig {
    &self.config
  }

  pub fn sender(&self) -> Arc<dyn IqSender> {
    self.sender.clone()
  }

  pub fn bridge_registry(&self) -> &BridgeRegistry {
    &self.bridge_registry
  }

  pub fn jibri_detector(&self) -> &JibriDetector {
    &self.jibri_detector
  }

  pub fn auth(&self) -> &Arc<AuthenticationAuthority> {
    &self.auth
  }

  pub fn jingle_registry(&self) -> &JingleSessionRegistry {
    &self.jingle_registry
  }

  pub fn stats(&self) -> &Arc<FocusStats> {
    &self.stats
  }

  pub async fn conference_exists(&self, room: &BareJid) -> bool {
    self.conferences.lock().await.contains_key(room)
  }

  pub async fn get_conference(&self, room: &BareJid) -> Option<Arc<JitsiConference>> {
    self.conferences.lock().await.get(room).cloned()
  }

  pub async fn conferences(&self) -> Vec<Arc<JitsiConference>> {
    self.conferences.lock().await.values().cloned().collect()
  }

  pub async fn health(&self) -> FocusHealth {
    FocusHealth {
      operational_bridges: self.bridge_registry.operational_count(),
      conferences: self.conferences.lock().await.len(),
    }
  }

  /// Returns the conference for `room`, creating and starting it first if
  /// needed.
  pub async fn conference_request(self: &Arc<Self>, room: BareJid) -> Result<Arc<JitsiConference>> {
    let mut conferences = self.conferences.lock().await;
    if let Some(conference) = conferences.get(&room) {
      return Ok(conference.clone());
    }
    info!(room = %room, "creating conference");
    let selector =
      BridgeSelector::new(self.bridge_registry.clone(), self.config.selection_strategy);
    let colibri = ColibriSessionManager::new(
      self.sender.clone(),
      selector,
      self.focus_jid.clone(),
      Uuid::new_v4().to_string(),
      room.to_string(),
      self.stats.clone(),
    );
    let conference = JitsiConference::new(
      self.config.clone(),
      self.sender.clone(),
      colibri,
      self.jingle_registry.clone(),
      self.jibri_detector.clone(),
      self.focus_jid.clone(),
      room.clone(),
      self.stats.clone(),
    );
    conference.start().await?;
    conferences.insert(room, conference.clone());
    Ok(conference)
  }

  /// Drops conferences that have ended or emptied out, releasing their
  /// authentication bindings.
  pub async fn reap_conferences(&self) {
    let mut ended = Vec::new();
    {
      let mut conferences = self.conferences.lock().await;
      let rooms: Vec<BareJid> = conferences.keys().cloned().collect();
      for room in rooms {
        let conference = conferences[&room].clone();
        if conference.is_ended().await
          || (conference.participant_count().await == 0
            && conference.muc_room().occupant_count().await == 0)
        {
          conferences.remove(&room);
          ended.push(room);
        }
      }
    }
    for room in ended {
      debug!(room = %room, "conference reaped");
      self.auth.conference_ended(&room);
    }
  }
}

/// Routes Jibri IQs to the conference that owns the session: start/stop by
/// room attribute, status updates by probing each conference.
#[derive(Clone)]
pub struct JibriIqHandler {
  manager: Arc<FocusManager>,
  sender: Arc<dyn IqSender>,
  focus_jid: FullJid,
}

impl JibriIqHandler {
  pub fn new(
    manager: Arc<FocusManager>,
    sender: Arc<dyn IqSender>,
    focus_jid: FullJid,
  ) -> JibriIqHandler {
    JibriIqHandler {
      manager,
      sender,
      focus_jid,
    }
  }

  async fn respond_result(&self, to: Jid, id: String, payload: JibriIq) -> Result<()> {
    let iq = Iq::from_result(id, Some(payload)).with_to(to).with_from(Jid::Full(
      self.focus_jid.clone(),
    ));
    self.sender.send_stanza(iq.into()).await
  }

  async fn respond_error(
    &self,
    to: Jid,
    id: String,
    kind: StanzaErrorKind,
    text: &str,
  ) -> Result<()> {
    let iq = Iq::from_error(id, kind.to_stanza_error(text))
      .with_to(to)
      .with_from(Jid::Full(self.focus_jid.clone()));
    self.sender.send_stanza(iq.into()).await
  }
}

#[async_trait]
impl StanzaFilter for JibriIqHandler {
  fn name(&self) -> &'static str {
    "jibri-iq"
  }

  fn filter(&self, element: &Element) -> bool {
    element.is("iq", ns::DEFAULT_NS)
      && element.attr("type") == Some("set")
      && element.children().any(|child| child.is("jibri", JIBRI))
  }

  async fn take(&self, element: Element) -> Result<()> {
    // Jibri starts await the instance's answer; hand off so the stanza
    // stream is free to deliver it.
    let handler = self.clone();
    tokio::spawn(async move {
      if let Err(e) = handler.process(element).await {
        warn!("jibri IQ processing failed: {:?}", e);
      }
    });
    Ok(())
  }
}

impl JibriIqHandler {
  async fn process(&self, element: Element) -> Result<()> {
    let iq = Iq::try_from(element)?;
    let from = match iq.from.clone() {
      Some(Jid::Full(from)) => from,
      _ => return Ok(()),
    };
    let reply_to = Jid::Full(from.clone());
    let payload = match iq.payload {
      IqType::Set(payload) => payload,
      _ => return Ok(()),
    };
    let jibri_iq = match JibriIq::try_from(payload) {
      Ok(jibri_iq) => jibri_iq,
      Err(e) => {
        debug!("malformed jibri IQ: {:?}", e);
        return self
          .respond_error(reply_to, iq.id, StanzaErrorKind::BadRequest, "malformed jibri IQ")
          .await;
      },
    };

    let conference = match &jibri_iq.room {
      Some(room) => self.manager.get_conference(room).await,
      None => {
        // Status updates do not carry the room; ask each conference.
        let mut found = None;
        for conference in self.manager.conferences().await {
          if conference.handle_jibri_iq(&from, &jibri_iq).await.is_ok() {
            found = Some(conference);
            break;
          }
        }
        match found {
          Some(_) => {
            return self.respond_result(reply_to, iq.id, JibriIq::default()).await;
          },
          None => None,
        }
      },
    };
    let conference = match conference {
      Some(conference) => conference,
      None => {
        return self
          .respond_error(
            reply_to,
            iq.id,
            StanzaErrorKind::ItemNotFound,
            "no such conference",
          )
          .await;
      },
    };
    match conference.handle_jibri_iq(&from, &jibri_iq).await {
      Ok(result) => self.respond_result(reply_to, iq.id, result).await,
      Err((kind, text)) => {
        warn!(from = %from, "jibri request failed: {}", text);
        self.respond_error(reply_to, iq.id, kind, &text).await
      },
    }
  }
}
