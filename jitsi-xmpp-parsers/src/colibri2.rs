use xmpp_parsers::{
  iq::{IqResultPayload, IqSetPayload},
  ns::JINGLE_SSMA,
  Element, Error,
};

use crate::{
  jingle_ssma::{Group, Source},
  ns::COLIBRI2,
  parse_bool,
};

fn flag(value: bool) -> Option<&'static str> {
  if value {
    Some("true")
  }
  else {
    None
  }
}

/// Conference allocation request sent by the focus to a bridge.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConferenceModify {
  /// Stable identifier shared by every bridge in the cascade.
  pub meeting_id: String,

  /// Human-readable conference name, sent on create.
  pub name: Option<String>,

  /// Whether the bridge should create the conference.
  pub create: bool,

  /// Whether the whole conference should be expired.
  pub expire: bool,

  pub endpoints: Vec<Endpoint>,
  pub relays: Vec<Relay>,
}

impl IqSetPayload for ConferenceModify {}

impl ConferenceModify {
  pub fn new(meeting_id: impl Into<String>) -> ConferenceModify {
    ConferenceModify {
      meeting_id: meeting_id.into(),
      ..Default::default()
    }
  }
}

impl TryFrom<Element> for ConferenceModify {
  type Error = Error;

  fn try_from(root: Element) -> Result<ConferenceModify, Error> {
    if !root.is("conference-modify", COLIBRI2) {
      return Err(Error::ParseError("not a conference-modify element"));
    }
    let mut request = ConferenceModify::new(
      root
        .attr("meeting-id")
        .ok_or(Error::ParseError("conference-modify element without meeting-id"))?,
    );
    request.name = root.attr("name").map(ToOwned::to_owned);
    request.create = root.attr("create").map(parse_bool).transpose()?.unwrap_or_default();
    request.expire = root.attr("expire").map(parse_bool).transpose()?.unwrap_or_default();
    for child in root.children().cloned() {
      if child.is("endpoint", COLIBRI2) {
        request.endpoints.push(Endpoint::try_from(child)?);
      }
      else if child.is("relay", COLIBRI2) {
        request.relays.push(Relay::try_from(child)?);
      }
    }
    Ok(request)
  }
}

impl From<ConferenceModify> for Element {
  fn from(request: ConferenceModify) -> Element {
    Element::builder("conference-modify", COLIBRI2)
      .attr("meeting-id", request.meeting_id)
      .attr("name", request.name)
      .attr("create", flag(request.create))
      .attr("expire", flag(request.expire))
      .append_all(request.endpoints.into_iter().map(Element::from))
      .append_all(request.relays.into_iter().map(Element::from))
      .build()
  }
}

/// One endpoint within a conference-modify / conference-modified exchange.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Endpoint {
  pub id: String,
  pub create: bool,
  pub expire: bool,
  pub stats_id: Option<String>,
  /// Named capabilities the bridge may use for this endpoint, e.g.
  /// `ssrc-rewriting`.
  pub capabilities: Vec<String>,
  pub media: Vec<Media>,
  pub transport: Option<Transport>,
  pub sources: Vec<MediaSource>,
}

impl Endpoint {
  pub fn new(id: impl Into<String>) -> Endpoint {
    Endpoint {
      id: id.into(),
      ..Default::default()
    }
  }
}

impl TryFrom<Element> for Endpoint {
  type Error = Error;

  fn try_from(root: Element) -> Result<Endpoint, Error> {
    if !root.is("endpoint", COLIBRI2) {
      return Err(Error::ParseError("not an endpoint element"));
    }
    let mut endpoint = Endpoint::new(
      root
        .attr("id")
        .ok_or(Error::ParseError("endpoint element without id"))?,
    );
    endpoint.create = root.attr("create").map(parse_bool).transpose()?.unwrap_or_default();
    endpoint.expire = root.attr("expire").map(parse_bool).transpose()?.unwrap_or_default();
    endpoint.stats_id = root.attr("stats-id").map(ToOwned::to_owned);
    for child in root.children().cloned() {
      if child.is("capability", COLIBRI2) {
        let name = child
          .attr("name")
          .ok_or(Error::ParseError("capability element without name"))?;
        endpoint.capabilities.push(name.to_owned());
      }
      else if child.is("media", COLIBRI2) {
        endpoint.media.push(Media::try_from(child)?);
      }
      else if child.is("transport", COLIBRI2) {
        endpoint.transport = Some(Transport::try_from(child)?);
      }
      else if child.is("sources", COLIBRI2) {
        for grandchild in child.children().cloned() {
          if grandchild.is("media-source", COLIBRI2) {
            endpoint.sources.push(MediaSource::try_from(grandchild)?);
          }
        }
      }
    }
    Ok(endpoint)
  }
}

impl From<Endpoint> for Element {
  fn from(endpoint: Endpoint) -> Element {
    let mut builder = Element::builder("endpoint", COLIBRI2)
      .attr("id", endpoint.id)
      .attr("create", flag(endpoint.create))
      .attr("expire", flag(endpoint.expire))
      .attr("stats-id", endpoint.stats_id)
      .append_all(endpoint.capabilities.into_iter().map(|name| {
        Element::builder("capability", COLIBRI2)
          .attr("name", name)
          .build()
      }))
      .append_all(endpoint.media.into_iter().map(Element::from))
      .append_all(endpoint.transport.map(Element::from));
    if !endpoint.sources.is_empty() {
      builder = builder.append(
        Element::builder("sources", COLIBRI2)
          .append_all(endpoint.sources.into_iter().map(Element::from))
          .build(),
      );
    }
    builder.build()
  }
}

/// Media section of an endpoint (audio or video).
#[derive(Debug, Clone, PartialEq)]
pub struct Media {
  pub kind: String,
}

impl Media {
  pub fn new(kind: impl Into<String>) -> Media {
    Media { kind: kind.into() }
  }
}

impl TryFrom<Element> for Media {
  type Error = Error;

  fn try_from(root: Element) -> Result<Media, Error> {
    if !root.is("media", COLIBRI2) {
      return Err(Error::ParseError("not a media element"));
    }
    Ok(Media {
      kind: root
        .attr("type")
        .ok_or(Error::ParseError("media element without type"))?
        .to_owned(),
    })
  }
}

impl From<Media> for Element {
  fn from(media: Media) -> Element {
    Element::builder("media", COLIBRI2)
      .attr("type", media.kind)
      .build()
  }
}

/// Transport wrapper. On requests only the attributes travel; on responses
/// the bridge returns its ICE-UDP transport as an opaque child element which
/// the focus forwards to the endpoint inside its Jingle offer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transport {
  pub ice_controlling: bool,
  pub payload: Option<Element>,
}

impl TryFrom<Element> for Transport {
  type Error = Error;

  fn try_from(root: Element) -> Result<Transport, Error> {
    if !root.is("transport", COLIBRI2) {
      return Err(Error::ParseError("not a colibri transport element"));
    }
    Ok(Transport {
      ice_controlling: root
        .attr("ice-controlling")
        .map(parse_bool)
        .transpose()?
        .unwrap_or_default(),
      payload: root.children().next().cloned(),
    })
  }
}

impl From<Transport> for Element {
  fn from(transport: Transport) -> Element {
    Element::builder("transport", COLIBRI2)
      .attr("ice-controlling", flag(transport.ice_controlling))
      .append_all(transport.payload)
      .build()
  }
}

/// The sources an endpoint or relay carries for one media type.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaSource {
  pub kind: String,
  pub id: Option<String>,
  pub sources: Vec<Source>,
  pub ssrc_groups: Vec<Group>,
}

impl MediaSource {
  pub fn new(kind: impl Into<String>) -> MediaSource {
    MediaSource {
      kind: kind.into(),
      ..Default::default()
    }
  }
}

impl TryFrom<Element> for MediaSource {
  type Error = Error;

  fn try_from(root: Element) -> Result<MediaSource, Error> {
    if !root.is("media-source", COLIBRI2) {
      return Err(Error::ParseError("not a media-source element"));
    }
    let mut media_source = MediaSource::new(
      root
        .attr("type")
        .ok_or(Error::ParseError("media-source element without type"))?,
    );
    media_source.id = root.attr("id").map(ToOwned::to_owned);
    for child in root.children().cloned() {
      if child.is("source", JINGLE_SSMA) {
        media_source.sources.push(Source::try_from(child)?);
      }
      else if child.is("ssrc-group", JINGLE_SSMA) {
        media_source.ssrc_groups.push(Group::try_from(child)?);
      }
    }
    Ok(media_source)
  }
}

impl From<MediaSource> for Element {
  fn from(media_source: MediaSource) -> Element {
    Element::builder("media-source", COLIBRI2)
      .attr("type", media_source.kind)
      .attr("id", media_source.id)
      .append_all(media_source.sources.into_iter().map(Element::from))
      .append_all(media_source.ssrc_groups.into_iter().map(Element::from))
      .build()
  }
}

/// A relay channel towards another bridge in the cascade.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Relay {
  pub id: String,
  pub create: bool,
  pub expire: bool,
  pub mesh_id: Option<String>,
  pub transport: Option<Transport>,
}

impl Relay {
  pub fn new(id: impl Into<String>) -> Relay {
    Relay {
      id: id.into(),
      ..Default::default()
    }
  }
}

impl TryFrom<Element> for Relay {
  type Error = Error;

  fn try_from(root: Element) -> Result<Relay, Error> {
    if !root.is("relay", COLIBRI2) {
      return Err(Error::ParseError("not a relay element"));
    }
    let mut relay = Relay::new(
      root
        .attr("id")
        .ok_or(Error::ParseError("relay element without id"))?,
    );
    relay.create = root.attr("create").map(parse_bool).transpose()?.unwrap_or_default();
    relay.expire = root.attr("expire").map(parse_bool).transpose()?.unwrap_or_default();
    relay.mesh_id = root.attr("mesh-id").map(ToOwned::to_owned);
    for child in root.children().cloned() {
      if child.is("transport", COLIBRI2) {
        relay.transport = Some(Transport::try_from(child)?);
      }
    }
    Ok(relay)
  }
}

impl From<Relay> for Element {
  fn from(relay: Relay) -> Element {
    Element::builder("relay", COLIBRI2)
      .attr("id", relay.id)
      .attr("create", flag(relay.create))
      .attr("expire", flag(relay.expire))
      .attr("mesh-id", relay.mesh_id)
      .append_all(relay.transport.map(Element::from))
      .build()
  }
}

/// The bridge's answer to a conference-modify.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConferenceModified {
  pub endpoints: Vec<Endpoint>,
  pub relays: Vec<Relay>,
  /// Feedback sources allocated by the bridge itself.
  pub sources: Vec<MediaSource>,
}

impl IqResultPayload for ConferenceModified {}

impl TryFrom<Element> for ConferenceModified {
  type Error = Error;

  fn try_from(root: Element) -> Result<ConferenceModified, Error> {
    if !root.is("conference-modified", COLIBRI2) {
      return Err(Error::ParseError("not a conference-modified element"));
    }
    let mut response = ConferenceModified::default();
    for child in root.children().cloned() {
      if child.is("endpoint", COLIBRI2) {
        response.endpoints.push(Endpoint::try_from(child)?);
      }
      else if child.is("relay", COLIBRI2) {
        response.relays.push(Relay::try_from(child)?);
      }
      else if child.is("sources", COLIBRI2) {
        for grandchild in child.children().cloned() {
          if grandchild.is("media-source", COLIBRI2) {
            response.sources.push(MediaSource::try_from(grandchild)?);
          }
        }
      }
    }
    Ok(response)
  }
}

impl From<ConferenceModified> for Element {
  fn from(response: ConferenceModified) -> Element {
    let mut builder = Element::builder("conference-modified", COLIBRI2)
      .append_all(response.endpoints.into_iter().map(Element::from))
      .append_all(response.relays.into_iter().map(Element::from));
    if !response.sources.is_empty() {
      builder = builder.append(
        Element::builder("sources", COLIBRI2)
          .append_all(response.sources.into_iter().map(Element::from))
          .build(),
      );
    }
    builder.build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn allocation_request_round_trip() {
    let mut endpoint = Endpoint::new("a1b2c3d4");
    endpoint.create = true;
    endpoint.capabilities = vec!["ssrc-rewriting".to_owned()];
    endpoint.media = vec![Media::new("audio"), Media::new("video")];
    endpoint.transport = Some(Transport {
      ice_controlling: true,
      payload: None,
    });
    let mut request = ConferenceModify::new("meeting-1");
    request.create = true;
    request.name = Some("r1@conference.example.com".to_owned());
    request.endpoints.push(endpoint);
    let elem = Element::from(request.clone());
    assert_eq!(ConferenceModify::try_from(elem).unwrap(), request);
  }

  #[test]
  fn parse_modified_with_transport() {
    let elem: Element = "<conference-modified xmlns='jitsi:colibri2'>
    <endpoint id='a1b2c3d4' xmlns='jitsi:colibri2'>
        <transport xmlns='jitsi:colibri2'>
            <transport ufrag='u1' pwd='p1' xmlns='urn:xmpp:jingle:transports:ice-udp:1'/>
        </transport>
    </endpoint>
</conference-modified>"
      .parse()
      .unwrap();
    let response = ConferenceModified::try_from(elem).unwrap();
    assert_eq!(response.endpoints.len(), 1);
    let transport = response.endpoints[0].transport.as_ref().unwrap();
    assert!(transport.payload.is_some());
  }

  #[test]
  fn relay_round_trip() {
    let mut relay = Relay::new("bridge2");
    relay.create = true;
    relay.mesh_id = Some("0".to_owned());
    let elem = Element::from(relay.clone());
    assert_eq!(Relay::try_from(elem).unwrap(), relay);
  }
}
