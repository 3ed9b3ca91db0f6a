use std::str::FromStr;

use xmpp_parsers::{Element, Error};

use crate::{
  jibri_iq::{FailureReason, JibriStatus, RecordingMode},
  ns::JIBRI,
};

/// Whether a Jibri instance is free to take a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyStatus {
  Idle,
  Busy,
}

impl FromStr for BusyStatus {
  type Err = Error;

  fn from_str(s: &str) -> Result<BusyStatus, Error> {
    match s {
      "idle" => Ok(BusyStatus::Idle),
      "busy" => Ok(BusyStatus::Busy),
      _ => Err(Error::ParseError("unknown jibri busy status")),
    }
  }
}

impl std::fmt::Display for BusyStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      BusyStatus::Idle => "idle",
      BusyStatus::Busy => "busy",
    })
  }
}

/// Health as reported by the instance itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
  Healthy,
  Unhealthy,
}

impl FromStr for HealthStatus {
  type Err = Error;

  fn from_str(s: &str) -> Result<HealthStatus, Error> {
    match s {
      "healthy" => Ok(HealthStatus::Healthy),
      "unhealthy" => Ok(HealthStatus::Unhealthy),
      _ => Err(Error::ParseError("unknown jibri health status")),
    }
  }
}

impl std::fmt::Display for HealthStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      HealthStatus::Healthy => "healthy",
      HealthStatus::Unhealthy => "unhealthy",
    })
  }
}

/// Presence extension published by Jibri instances in their brewery MUC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JibriBreweryStatus {
  pub busy: BusyStatus,
  pub health: HealthStatus,
}

impl JibriBreweryStatus {
  pub fn available(&self) -> bool {
    self.busy == BusyStatus::Idle && self.health == HealthStatus::Healthy
  }
}

impl TryFrom<Element> for JibriBreweryStatus {
  type Error = Error;

  fn try_from(root: Element) -> Result<JibriBreweryStatus, Error> {
    if !root.is("jibri-status", JIBRI) {
      return Err(Error::ParseError("not a jibri-status element"));
    }
    let mut busy = None;
    let mut health = None;
    for child in root.children() {
      if child.is("busy-status", JIBRI) {
        busy = Some(
          child
            .attr("status")
            .ok_or(Error::ParseError("busy-status element without status"))?
            .parse()?,
        );
      }
      else if child.is("health-status", JIBRI) {
        health = Some(
          child
            .attr("status")
            .ok_or(Error::ParseError("health-status element without status"))?
            .parse()?,
        );
      }
    }
    Ok(JibriBreweryStatus {
      busy: busy.ok_or(Error::ParseError("jibri-status element without busy-status"))?,
      health: health.ok_or(Error::ParseError(
        "jibri-status element without health-status",
      ))?,
    })
  }
}

impl From<JibriBreweryStatus> for Element {
  fn from(status: JibriBreweryStatus) -> Element {
    Element::builder("jibri-status", JIBRI)
      .append(
        Element::builder("busy-status", JIBRI)
          .attr("status", status.busy.to_string())
          .build(),
      )
      .append(
        Element::builder("health-status", JIBRI)
          .attr("status", status.health.to_string())
          .build(),
      )
      .build()
  }
}

/// Recording / live-streaming state, published by the focus as a presence
/// extension on the conference MUC.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingStatus {
  pub status: JibriStatus,
  pub mode: RecordingMode,
  pub session_id: Option<String>,
  pub failure_reason: Option<FailureReason>,
}

impl TryFrom<Element> for RecordingStatus {
  type Error = Error;

  fn try_from(root: Element) -> Result<RecordingStatus, Error> {
    if !root.is("jibri-recording-status", JIBRI) {
      return Err(Error::ParseError("not a jibri-recording-status element"));
    }
    Ok(RecordingStatus {
      status: root
        .attr("status")
        .ok_or(Error::ParseError("recording-status element without status"))?
        .parse()?,
      mode: root
        .attr("recording_mode")
        .ok_or(Error::ParseError("recording-status element without mode"))?
        .parse()?,
      session_id: root.attr("session_id").map(ToOwned::to_owned),
      failure_reason: root.attr("failure_reason").map(str::parse).transpose()?,
    })
  }
}

impl From<RecordingStatus> for Element {
  fn from(status: RecordingStatus) -> Element {
    Element::builder("jibri-recording-status", JIBRI)
      .attr("status", status.status.to_string())
      .attr("recording_mode", status.mode.to_string())
      .attr("session_id", status.session_id)
      .attr(
        "failure_reason",
        status.failure_reason.map(|reason| reason.to_string()),
      )
      .build()
  }
}

/// SIP gateway call state, published by the focus as a presence extension on
/// the conference MUC.
#[derive(Debug, Clone, PartialEq)]
pub struct SipCallState {
  pub status: JibriStatus,
  pub sip_address: String,
  pub session_id: Option<String>,
  pub failure_reason: Option<FailureReason>,
}

impl TryFrom<Element> for SipCallState {
  type Error = Error;

  fn try_from(root: Element) -> Result<SipCallState, Error> {
    if !root.is("jibri-sip-call-state", JIBRI) {
      return Err(Error::ParseError("not a jibri-sip-call-state element"));
    }
    Ok(SipCallState {
      status: root
        .attr("status")
        .ok_or(Error::ParseError("sip-call-state element without status"))?
        .parse()?,
      sip_address: root
        .attr("sipaddress")
        .ok_or(Error::ParseError("sip-call-state element without sipaddress"))?
        .to_owned(),
      session_id: root.attr("session_id").map(ToOwned::to_owned),
      failure_reason: root.attr("failure_reason").map(str::parse).transpose()?,
    })
  }
}

impl From<SipCallState> for Element {
  fn from(state: SipCallState) -> Element {
    Element::builder("jibri-sip-call-state", JIBRI)
      .attr("status", state.status.to_string())
      .attr("sipaddress", state.sip_address)
      .attr("session_id", state.session_id)
      .attr(
        "failure_reason",
        state.failure_reason.map(|reason| reason.to_string()),
      )
      .build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_brewery_status() {
    let elem: Element = "<jibri-status xmlns='http://jitsi.org/protocol/jibri'>
    <busy-status status='idle' xmlns='http://jitsi.org/protocol/jibri'/>
    <health-status status='healthy' xmlns='http://jitsi.org/protocol/jibri'/>
</jibri-status>"
      .parse()
      .unwrap();
    let status = JibriBreweryStatus::try_from(elem).unwrap();
    assert!(status.available());
  }

  #[test]
  fn busy_is_not_available() {
    let status = JibriBreweryStatus {
      busy: BusyStatus::Busy,
      health: HealthStatus::Healthy,
    };
    assert!(!status.available());
  }

  #[test]
  fn recording_status_round_trip() {
    let status = RecordingStatus {
      status: JibriStatus::Pending,
      mode: RecordingMode::File,
      session_id: Some("s1".to_owned()),
      failure_reason: None,
    };
    let elem = Element::from(status.clone());
    assert_eq!(RecordingStatus::try_from(elem).unwrap(), status);
  }
}
