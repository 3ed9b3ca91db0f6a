use std::{
  collections::HashMap,
  sync::{Arc, RwLock},
  time::{Duration, Instant},
};

use jitsi_xmpp_parsers::conference_iq::{ConferenceIq, SessionInvalid};
use tokio::time;
use tracing::{debug, info};
use xmpp_parsers::{stanza_error::StanzaError, BareJid, Jid};

use uuid::Uuid;

use crate::{config::FocusConfig, error::StanzaErrorKind};

const EXPIRY_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// One authenticated machine. `activity` moves forward every time the
/// session is used; the sweeper reaps idle ones.
#[derive(Debug, Clone)]
pub struct AuthenticationSession {
  pub session_id: String,
  pub machine_uid: String,
  pub user_identity: String,
  pub room: BareJid,
  activity: Instant,
}

/// Session-id to identity bindings, shared by every conference.
pub struct AuthenticationAuthority {
  sessions: RwLock<HashMap<String, AuthenticationSession>>,
  lifetime: Duration,
  trusted_domain: Option<String>,
  enable_auto_login: bool,
}

impl AuthenticationAuthority {
  pub fn new(config: &FocusConfig) -> Arc<AuthenticationAuthority> {
    Arc::new(AuthenticationAuthority {
      sessions: RwLock::new(HashMap::new()),
      lifetime: config.authentication_lifetime,
      trusted_domain: config.trusted_domain.clone(),
      enable_auto_login: config.enable_auto_login,
    })
  }

  pub fn create_session(
    &self,
    machine_uid: impl Into<String>,
    user_identity: impl Into<String>,
    room: BareJid,
  ) -> String {
    let session = AuthenticationSession {
      session_id: Uuid::new_v4().to_string(),
      machine_uid: machine_uid.into(),
      user_identity: user_identity.into(),
      room,
      activity: Instant::now(),
    };
    let session_id = session.session_id.clone();
    info!(
      identity = session.user_identity.as_str(),
      "created authentication session"
    );
    self.sessions.write().unwrap().insert(session_id.clone(), session);
    session_id
  }

  pub fn get_session(&self, session_id: &str) -> Option<AuthenticationSession> {
    self.get_session_at(session_id, Instant::now())
  }

  pub(crate) fn get_session_at(
    &self,
    session_id: &str,
    now: Instant,
  ) -> Option<AuthenticationSession> {
    let sessions = self.sessions.read().unwrap();
    let session = sessions.get(session_id)?;
    if now.duration_since(session.activity) > self.lifetime {
      return None;
    }
    Some(session.clone())
  }

  pub fn find_by_jid(&self, jid: &Jid) -> Option<AuthenticationSession> {
    let identity = match jid {
      Jid::Full(full) => BareJid::from(full.clone()).to_string(),
      Jid::Bare(bare) => bare.to_string(),
    };
    self
      .sessions
      .read()
      .unwrap()
      .values()
      .find(|session| session.user_identity == identity)
      .cloned()
  }

  pub fn destroy(&self, session_id: &str) {
    if self.sessions.write().unwrap().remove(session_id).is_some() {
      debug!(session_id, "destroyed authentication session");
    }
  }

  fn touch(&self, session_id: &str) {
    if let Some(session) = self.sessions.write().unwrap().get_mut(session_id) {
      session.activity = Instant::now();
    }
  }

  /// Drops room-bound sessions when a conference ends, unless auto-login
  /// lets users come back without re-authenticating.
  pub fn conference_ended(&self, room: &BareJid) {
    if self.enable_auto_login {
      return;
    }
    self
      .sessions
      .write()
      .unwrap()
      .retain(|_, session| &session.room != room);
  }

  pub(crate) fn evict_expired(&self, now: Instant) {
    self.sessions.write().unwrap().retain(|_, session| {
      let keep = now.duration_since(session.activity) <= self.lifetime;
      if !keep {
        debug!(
          identity = session.user_identity.as_str(),
          "authentication session expired"
        );
      }
      keep
    });
  }

  /// Background sweep for idle sessions.
  pub fn start_expiry_sweep(self: &Arc<Self>) {
    let authority = self.clone();
    tokio::spawn(async move {
      let mut interval = time::interval(EXPIRY_POLL_INTERVAL);
      loop {
        interval.tick().await;
        authority.evict_expired(Instant::now());
      }
    });
  }

  /// Admission check for an inbound conference IQ. `Ok(Some(id))` means the
  /// request is authenticated under that session id.
  pub fn verify(
    &self,
    iq: &ConferenceIq,
    from: &Jid,
    room_exists: bool,
  ) -> Result<Option<String>, StanzaError> {
    if let Some(session_id) = &iq.session_id {
      let session = match self.get_session(session_id) {
        Some(session) => session,
        None => {
          return Err(StanzaErrorKind::NotAcceptable.to_stanza_error_with_extension(
            "invalid session",
            SessionInvalid.into(),
          ));
        },
      };
      let machine_uid = iq.machine_uid.as_deref().unwrap_or("");
      if machine_uid.is_empty() || machine_uid != session.machine_uid {
        return Err(
          StanzaErrorKind::NotAcceptable.to_stanza_error("machine UID mismatch or empty"),
        );
      }
      self.touch(session_id);
      return Ok(Some(session_id.clone()));
    }

    let from_domain = match from {
      Jid::Full(full) => full.domain.clone(),
      Jid::Bare(bare) => bare.domain.clone(),
    };
    let trusted = self
      .trusted_domain
      .as_deref()
      .map(|domain| domain == from_domain)
      .unwrap_or_default();
    let machine_uid = iq.machine_uid.as_deref().unwrap_or("");
    if trusted && !machine_uid.is_empty() {
      let identity = match from {
        Jid::Full(full) => BareJid::from(full.clone()).to_string(),
        Jid::Bare(bare) => bare.to_string(),
      };
      return Ok(Some(self.create_session(
        machine_uid,
        identity,
        iq.room.clone(),
      )));
    }
    if room_exists {
      // Anyone may join a conference that is already running.
      return Ok(None);
    }
    Err(StanzaErrorKind::NotAuthorized.to_stanza_error("not authorized to create the room"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use xmpp_parsers::stanza_error::DefinedCondition;

  fn authority(trusted: Option<&str>) -> Arc<AuthenticationAuthority> {
    let config = FocusConfig {
      trusted_domain: trusted.map(ToOwned::to_owned),
      ..Default::default()
    };
    AuthenticationAuthority::new(&config)
  }

  fn room() -> BareJid {
    "r1@conference.example.com".parse().unwrap()
  }

  fn request(machine_uid: Option<&str>, session_id: Option<&str>) -> ConferenceIq {
    let mut iq = ConferenceIq::new(room());
    iq.machine_uid = machine_uid.map(ToOwned::to_owned);
    iq.session_id = session_id.map(ToOwned::to_owned);
    iq
  }

  fn jid(s: &str) -> Jid {
    Jid::Bare(s.parse().unwrap())
  }

  #[test]
  fn untrusted_user_creating_a_room_is_not_authorized() {
    let authority = authority(Some("auth.server.net"));
    let result = authority.verify(&request(Some("u1"), None), &jid("user1@server.net"), false);
    assert_eq!(
      result.unwrap_err().defined_condition,
      DefinedCondition::NotAuthorized
    );
  }

  #[test]
  fn trusted_domain_user_gets_a_session() {
    let authority = authority(Some("auth.server.net"));
    let result = authority
      .verify(&request(Some("u1"), None), &jid("user1@auth.server.net"), false)
      .unwrap();
    let session_id = result.unwrap();
    let session = authority.get_session(&session_id).unwrap();
    assert_eq!(session.machine_uid, "u1");
    assert_eq!(session.user_identity, "user1@auth.server.net");
  }

  #[test]
  fn stolen_session_is_rejected() {
    let authority = authority(Some("auth.server.net"));
    let session_id = authority
      .verify(&request(Some("u1"), None), &jid("user1@auth.server.net"), false)
      .unwrap()
      .unwrap();
    // Someone else presents the session with a different machine uid.
    let result = authority.verify(
      &request(Some("u2"), Some(&session_id)),
      &jid("user2@guest.server.net"),
      true,
    );
    assert_eq!(
      result.unwrap_err().defined_condition,
      DefinedCondition::NotAcceptable
    );
  }

  #[test]
  fn unknown_session_id_carries_session_invalid() {
    let authority = authority(None);
    let result = authority.verify(
      &request(Some("u1"), Some("no-such-session")),
      &jid("user1@server.net"),
      true,
    );
    let error = result.unwrap_err();
    assert_eq!(error.defined_condition, DefinedCondition::NotAcceptable);
    assert!(error.other.is_some());
  }

  #[test]
  fn same_user_new_machine_gets_a_fresh_session() {
    let authority = authority(Some("auth.server.net"));
    let first = authority
      .verify(&request(Some("u1"), None), &jid("user1@auth.server.net"), false)
      .unwrap()
      .unwrap();
    let second = authority
      .verify(&request(Some("u3"), None), &jid("user1@auth.server.net"), false)
      .unwrap()
      .unwrap();
    assert_ne!(first, second);
  }

  #[test]
  fn unauthenticated_join_is_fine_when_the_room_exists() {
    let authority = authority(Some("auth.server.net"));
    let result = authority
      .verify(&request(Some("u1"), None), &jid("user1@server.net"), true)
      .unwrap();
    assert_eq!(result, None);
  }

  #[test]
  fn sessions_expire_after_the_lifetime() {
    let authority = authority(None);
    let session_id = authority.create_session("u1", "user1@server.net", room());
    let now = Instant::now();
    assert!(authority
      .get_session_at(&session_id, now + Duration::from_secs(60))
      .is_some());
    let beyond = now + authority.lifetime + Duration::from_secs(1);
    assert!(authority.get_session_at(&session_id, beyond).is_none());
    authority.evict_expired(beyond);
    assert!(authority.sessions.read().unwrap().is_empty());
  }

  #[test]
  fn conference_ended_reaps_room_sessions_without_auto_login() {
    let config = FocusConfig {
      enable_auto_login: false,
      ..Default::default()
    };
    let authority = AuthenticationAuthority::new(&config);
    authority.create_session("u1", "user1@server.net", room());
    authority.conference_ended(&room());
    assert!(authority.sessions.read().unwrap().is_empty());
  }
}
