use std::str::FromStr;

use jid::BareJid;
use xmpp_parsers::{
  iq::{IqResultPayload, IqSetPayload},
  Element, Error,
};

use crate::{ns::JIBRI, parse_bool};

/// The action attribute of a Jibri IQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JibriAction {
  Start,
  Stop,
}

impl FromStr for JibriAction {
  type Err = Error;

  fn from_str(s: &str) -> Result<JibriAction, Error> {
    match s {
      "start" => Ok(JibriAction::Start),
      "stop" => Ok(JibriAction::Stop),
      _ => Err(Error::ParseError("unknown jibri action")),
    }
  }
}

impl std::fmt::Display for JibriAction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      JibriAction::Start => "start",
      JibriAction::Stop => "stop",
    })
  }
}

/// The status attribute of a Jibri IQ or recording-status extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JibriStatus {
  Pending,
  On,
  Off,
}

impl FromStr for JibriStatus {
  type Err = Error;

  fn from_str(s: &str) -> Result<JibriStatus, Error> {
    match s {
      "pending" => Ok(JibriStatus::Pending),
      "on" => Ok(JibriStatus::On),
      "off" => Ok(JibriStatus::Off),
      _ => Err(Error::ParseError("unknown jibri status")),
    }
  }
}

impl std::fmt::Display for JibriStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      JibriStatus::Pending => "pending",
      JibriStatus::On => "on",
      JibriStatus::Off => "off",
    })
  }
}

/// Whether a recording session writes to a file or streams out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingMode {
  File,
  Stream,
}

impl FromStr for RecordingMode {
  type Err = Error;

  fn from_str(s: &str) -> Result<RecordingMode, Error> {
    match s {
      "file" => Ok(RecordingMode::File),
      "stream" => Ok(RecordingMode::Stream),
      _ => Err(Error::ParseError("unknown recording mode")),
    }
  }
}

impl std::fmt::Display for RecordingMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      RecordingMode::File => "file",
      RecordingMode::Stream => "stream",
    })
  }
}

/// Why a Jibri gave up on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
  Busy,
  Error,
}

impl FromStr for FailureReason {
  type Err = Error;

  fn from_str(s: &str) -> Result<FailureReason, Error> {
    match s {
      "busy" => Ok(FailureReason::Busy),
      "error" => Ok(FailureReason::Error),
      _ => Err(Error::ParseError("unknown jibri failure reason")),
    }
  }
}

impl std::fmt::Display for FailureReason {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      FailureReason::Busy => "busy",
      FailureReason::Error => "error",
    })
  }
}

/// Jibri control IQ, sent by moderators to the focus, by the focus to Jibri
/// instances, and by Jibri instances back to the focus as status updates.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JibriIq {
  pub action: Option<JibriAction>,
  pub status: Option<JibriStatus>,
  pub recording_mode: Option<RecordingMode>,
  pub room: Option<BareJid>,
  pub session_id: Option<String>,
  pub stream_id: Option<String>,
  pub youtube_broadcast_id: Option<String>,
  pub sip_address: Option<String>,
  pub display_name: Option<String>,
  pub app_data: Option<String>,
  pub failure_reason: Option<FailureReason>,
  pub should_retry: Option<bool>,
}

impl IqSetPayload for JibriIq {}
impl IqResultPayload for JibriIq {}

impl TryFrom<Element> for JibriIq {
  type Error = Error;

  fn try_from(root: Element) -> Result<JibriIq, Error> {
    if !root.is("jibri", JIBRI) {
      return Err(Error::ParseError("not a jibri element"));
    }
    Ok(JibriIq {
      action: root.attr("action").map(str::parse).transpose()?,
      status: root.attr("status").map(str::parse).transpose()?,
      recording_mode: root.attr("recording_mode").map(str::parse).transpose()?,
      room: root
        .attr("room")
        .map(str::parse)
        .transpose()
        .map_err(Error::JidParseError)?,
      session_id: root.attr("session_id").map(ToOwned::to_owned),
      stream_id: root.attr("streamid").map(ToOwned::to_owned),
      youtube_broadcast_id: root.attr("you_tube_broadcast_id").map(ToOwned::to_owned),
      sip_address: root.attr("sipaddress").map(ToOwned::to_owned),
      display_name: root.attr("displayname").map(ToOwned::to_owned),
      app_data: root.attr("app_data").map(ToOwned::to_owned),
      failure_reason: root.attr("failure_reason").map(str::parse).transpose()?,
      should_retry: root.attr("should_retry").map(parse_bool).transpose()?,
    })
  }
}

impl From<JibriIq> for Element {
  fn from(iq: JibriIq) -> Element {
    Element::builder("jibri", JIBRI)
      .attr("action", iq.action.map(|action| action.to_string()))
      .attr("status", iq.status.map(|status| status.to_string()))
      .attr(
        "recording_mode",
        iq.recording_mode.map(|mode| mode.to_string()),
      )
      .attr("room", iq.room.map(|room| room.to_string()))
      .attr("session_id", iq.session_id)
      .attr("streamid", iq.stream_id)
      .attr("you_tube_broadcast_id", iq.youtube_broadcast_id)
      .attr("sipaddress", iq.sip_address)
      .attr("displayname", iq.display_name)
      .attr("app_data", iq.app_data)
      .attr(
        "failure_reason",
        iq.failure_reason.map(|reason| reason.to_string()),
      )
      .attr("should_retry", iq.should_retry.map(|retry| retry.to_string()))
      .build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_start_request() {
    let elem: Element = "<jibri action='start' recording_mode='stream' streamid='rtmp://example/live' xmlns='http://jitsi.org/protocol/jibri'/>"
      .parse()
      .unwrap();
    let iq = JibriIq::try_from(elem).unwrap();
    assert_eq!(iq.action, Some(JibriAction::Start));
    assert_eq!(iq.recording_mode, Some(RecordingMode::Stream));
    assert_eq!(iq.stream_id.as_deref(), Some("rtmp://example/live"));
  }

  #[test]
  fn parse_status_update() {
    let elem: Element =
      "<jibri status='off' failure_reason='busy' should_retry='true' xmlns='http://jitsi.org/protocol/jibri'/>"
        .parse()
        .unwrap();
    let iq = JibriIq::try_from(elem).unwrap();
    assert_eq!(iq.status, Some(JibriStatus::Off));
    assert_eq!(iq.failure_reason, Some(FailureReason::Busy));
    assert_eq!(iq.should_retry, Some(true));
  }

  #[test]
  fn round_trip() {
    let iq = JibriIq {
      action: Some(JibriAction::Start),
      recording_mode: Some(RecordingMode::File),
      room: Some("r1@conference.example.com".parse().unwrap()),
      session_id: Some("abc".to_owned()),
      ..Default::default()
    };
    let elem = Element::from(iq.clone());
    assert_eq!(JibriIq::try_from(elem).unwrap(), iq);
  }
}
