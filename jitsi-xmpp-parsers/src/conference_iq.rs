use std::collections::HashMap;

use jid::BareJid;
use xmpp_parsers::{
  iq::{IqResultPayload, IqSetPayload},
  Element, Error,
};

use crate::{ns::JITSI_FOCUS, parse_bool};

/// The conference IQ sent by a client to the focus to create or join a
/// conference, and echoed back by the focus with the result attributes
/// filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct ConferenceIq {
  /// The room this request concerns.
  pub room: BareJid,

  /// An opaque identifier of the requesting machine, used to bind
  /// authentication sessions.
  pub machine_uid: Option<String>,

  /// The authentication session id, if the client holds one.
  pub session_id: Option<String>,

  /// The authenticated identity, filled in by the focus.
  pub identity: Option<String>,

  /// Whether the focus is ready for the room (result direction).
  pub ready: Option<bool>,

  /// The jid the focus uses in the room (result direction).
  pub focus_jid: Option<String>,

  /// Client-advertised or focus-advertised conference properties.
  pub properties: HashMap<String, String>,
}

impl IqSetPayload for ConferenceIq {}
impl IqResultPayload for ConferenceIq {}

impl ConferenceIq {
  pub fn new(room: BareJid) -> ConferenceIq {
    ConferenceIq {
      room,
      machine_uid: None,
      session_id: None,
      identity: None,
      ready: None,
      focus_jid: None,
      properties: HashMap::new(),
    }
  }
}

impl TryFrom<Element> for ConferenceIq {
  type Error = Error;

  fn try_from(root: Element) -> Result<ConferenceIq, Error> {
    if !root.is("conference", JITSI_FOCUS) {
      return Err(Error::ParseError("not a conference element"));
    }
    let room = root
      .attr("room")
      .ok_or(Error::ParseError("conference element without room"))?
      .parse()
      .map_err(Error::JidParseError)?;
    let mut iq = ConferenceIq::new(room);
    iq.machine_uid = root.attr("machine-uid").map(ToOwned::to_owned);
    iq.session_id = root.attr("session-id").map(ToOwned::to_owned);
    iq.identity = root.attr("identity").map(ToOwned::to_owned);
    iq.ready = root.attr("ready").map(parse_bool).transpose()?;
    iq.focus_jid = root.attr("focusjid").map(ToOwned::to_owned);
    for child in root.children() {
      if child.is("property", JITSI_FOCUS) {
        let name = child
          .attr("name")
          .ok_or(Error::ParseError("property element without name"))?;
        let value = child
          .attr("value")
          .ok_or(Error::ParseError("property element without value"))?;
        iq.properties.insert(name.to_owned(), value.to_owned());
      }
    }
    Ok(iq)
  }
}

impl From<ConferenceIq> for Element {
  fn from(iq: ConferenceIq) -> Element {
    Element::builder("conference", JITSI_FOCUS)
      .attr("room", iq.room.to_string())
      .attr("machine-uid", iq.machine_uid)
      .attr("session-id", iq.session_id)
      .attr("identity", iq.identity)
      .attr("ready", iq.ready.map(|ready| ready.to_string()))
      .attr("focusjid", iq.focus_jid)
      .append_all(iq.properties.into_iter().map(|(name, value)| {
        Element::builder("property", JITSI_FOCUS)
          .attr("name", name)
          .attr("value", value)
          .build()
      }))
      .build()
  }
}

/// Application-specific error extension returned when a client presents an
/// authentication session the focus does not recognise.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionInvalid;

impl TryFrom<Element> for SessionInvalid {
  type Error = Error;

  fn try_from(root: Element) -> Result<SessionInvalid, Error> {
    if !root.is("session-invalid", JITSI_FOCUS) {
      return Err(Error::ParseError("not a session-invalid element"));
    }
    Ok(SessionInvalid)
  }
}

impl From<SessionInvalid> for Element {
  fn from(_: SessionInvalid) -> Element {
    Element::builder("session-invalid", JITSI_FOCUS).build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_request() {
    let elem: Element = "<conference room='r1@conference.example.com' machine-uid='u1' xmlns='http://jitsi.org/protocol/focus'>
    <property name='startAudioMuted' value='10'/>
</conference>"
      .parse()
      .unwrap();
    let iq = ConferenceIq::try_from(elem).unwrap();
    assert_eq!(iq.room.to_string(), "r1@conference.example.com");
    assert_eq!(iq.machine_uid.as_deref(), Some("u1"));
    assert_eq!(iq.session_id, None);
    assert_eq!(iq.properties.get("startAudioMuted").map(String::as_str), Some("10"));
  }

  #[test]
  fn result_round_trip() {
    let mut iq = ConferenceIq::new("r1@conference.example.com".parse().unwrap());
    iq.ready = Some(true);
    iq.focus_jid = Some("focus@auth.example.com/focus".to_owned());
    iq.session_id = Some("s1".to_owned());
    let elem = Element::from(iq.clone());
    assert_eq!(ConferenceIq::try_from(elem).unwrap(), iq);
  }
}
