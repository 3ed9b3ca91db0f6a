use std::sync::Arc;

use xmpp_parsers::FullJid;

use crate::{
  jingle::JingleSession,
  source::EndpointSourceSet,
  source_signaling::{SourceAddRemoveQueue, SourceFilter, SourceSignaling},
  xmpp::{muc::MucOccupant, ns},
};

/// What an endpoint advertised it can do, read from its MUC presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
  pub audio: bool,
  pub video: bool,
  /// Understands named sources.
  pub source_names: bool,
  /// Accepts sources as compact JSON instead of inline Jingle contents.
  pub json_sources: bool,
  /// Can receive more than one video stream per remote endpoint.
  pub receive_multiple_streams: bool,
  /// Can receive simulcast.
  pub receive_simulcast: bool,
}

impl Default for Features {
  fn default() -> Features {
    Features {
      audio: true,
      video: true,
      source_names: false,
      json_sources: false,
      receive_multiple_streams: false,
      receive_simulcast: true,
    }
  }
}

impl Features {
  /// Reads the `<features/>` presence extension, falling back to
  /// conservative defaults for clients that do not publish one.
  pub fn from_occupant(occupant: &MucOccupant) -> Features {
    let mut features = Features::default();
    let list = occupant
      .payloads
      .iter()
      .find(|payload| payload.name() == "features");
    if let Some(list) = list {
      for feature in list.children() {
        if feature.name() == "feature" {
          match feature.attr("var") {
            Some(ns::SOURCE_NAMES) => features.source_names = true,
            Some(ns::JSON_SOURCES) => features.json_sources = true,
            Some(ns::RECEIVE_MULTIPLE_STREAMS) => features.receive_multiple_streams = true,
            Some(ns::SIMULCAST) => features.receive_simulcast = true,
            _ => {},
          }
        }
      }
    }
    features
  }

  pub fn source_filter(&self) -> SourceFilter {
    SourceFilter {
      audio: self.audio,
      video: self.video,
      receive_simulcast: self.receive_simulcast,
      receive_multiple_streams: self.receive_multiple_streams,
    }
  }
}

/// One endpoint in a conference. Everything here is mutated on the
/// conference's task queue only.
pub struct Participant {
  pub endpoint_id: String,
  pub occupant_jid: FullJid,
  pub features: Features,
  pub region: Option<String>,
  pub is_moderator: bool,

  /// The offer/answer session, while one is live.
  pub jingle_session: Option<Arc<JingleSession>>,

  /// Sources this endpoint advertised and we accepted.
  pub sources: EndpointSourceSet,

  /// Diff tracker for what this endpoint has been told about the others.
  pub signaling: SourceSignaling,

  /// Updates that arrived while the session was not yet ready.
  pub pending_updates: SourceAddRemoveQueue,
}

impl Participant {
  pub fn new(occupant: &MucOccupant, region: Option<String>) -> Participant {
    let features = Features::from_occupant(occupant);
    Participant {
      endpoint_id: occupant.nick().to_owned(),
      occupant_jid: occupant.occupant_jid.clone(),
      features,
      region,
      is_moderator: occupant.is_moderator(),
      jingle_session: None,
      sources: EndpointSourceSet::default(),
      signaling: SourceSignaling::new(features.source_filter()),
      pending_updates: SourceAddRemoveQueue::new(),
    }
  }

  /// The region the endpoint advertised in its presence, if any.
  pub fn region_from_occupant(occupant: &MucOccupant) -> Option<String> {
    if let Some(region) = occupant
      .payloads
      .iter()
      .find(|payload| payload.name() == "jitsi_participant_region")
    {
      let text = region.text();
      if !text.is_empty() {
        return Some(text);
      }
    }
    occupant
      .payloads
      .iter()
      .find(|payload| payload.name() == "region")
      .and_then(|region| region.attr("id").map(ToOwned::to_owned))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use xmpp_parsers::{
    muc::user::{Affiliation, Role},
    Element,
  };

  fn occupant_with(payloads: Vec<Element>) -> MucOccupant {
    MucOccupant {
      occupant_jid: "r1@conference.example.com/abcd1234".parse().unwrap(),
      real_jid: None,
      role: Role::Participant,
      affiliation: Affiliation::Member,
      payloads,
    }
  }

  #[test]
  fn parses_features_from_presence() {
    let features: Element = "<features xmlns='jabber:client'>
  <feature var='http://jitsi.org/json-encoded-sources'/>
  <feature var='http://jitsi.org/receive-multiple-video-streams'/>
</features>"
      .parse()
      .unwrap();
    let occupant = occupant_with(vec![features]);
    let features = Features::from_occupant(&occupant);
    assert!(features.json_sources);
    assert!(features.receive_multiple_streams);
    assert!(!features.source_names);
  }

  #[test]
  fn missing_features_use_defaults() {
    let occupant = occupant_with(vec![]);
    assert_eq!(Features::from_occupant(&occupant), Features::default());
  }

  #[test]
  fn reads_region_from_presence() {
    let region: Element =
      "<region xmlns='http://jitsi.org/jitsi-meet' id='eu-west'/>".parse().unwrap();
    let occupant = occupant_with(vec![region]);
    assert_eq!(
      Participant::region_from_occupant(&occupant).as_deref(),
      Some("eu-west")
    );
  }
}
