use std::str::FromStr;

use jid::Jid;
use minidom::NSChoice::Any;
use xmpp_parsers::{
  iq::IqSetPayload,
  jingle::{ContentId, Creator, Disposition, ReasonElement, Senders, SessionId},
  jingle_grouping::Group,
  ns::{JINGLE, JINGLE_GROUPING, JINGLE_ICE_UDP, JINGLE_RTP},
  Element, Error,
};

use crate::{
  jingle_ice_udp::Transport as IceUdpTransport, jingle_rtp::Description as RtpDescription,
};

/// The Jingle action attribute, including the non-standard source signaling
/// actions used by Jitsi Meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
  ContentAccept,
  ContentAdd,
  ContentModify,
  ContentReject,
  ContentRemove,
  DescriptionInfo,
  SecurityInfo,
  SessionAccept,
  SessionInfo,
  SessionInitiate,
  SessionTerminate,
  TransportAccept,
  TransportInfo,
  TransportReject,
  TransportReplace,

  /// Add a source to existing content (Jitsi Meet).
  SourceAdd,

  /// Remove a source from existing content (Jitsi Meet).
  SourceRemove,
}

impl FromStr for Action {
  type Err = Error;

  fn from_str(s: &str) -> Result<Action, Error> {
    Ok(match s {
      "content-accept" => Action::ContentAccept,
      "content-add" => Action::ContentAdd,
      "content-modify" => Action::ContentModify,
      "content-reject" => Action::ContentReject,
      "content-remove" => Action::ContentRemove,
      "description-info" => Action::DescriptionInfo,
      "security-info" => Action::SecurityInfo,
      "session-accept" => Action::SessionAccept,
      "session-info" => Action::SessionInfo,
      "session-initiate" => Action::SessionInitiate,
      "session-terminate" => Action::SessionTerminate,
      "transport-accept" => Action::TransportAccept,
      "transport-info" => Action::TransportInfo,
      "transport-reject" => Action::TransportReject,
      "transport-replace" => Action::TransportReplace,
      // Jitsi Meet clients historically used the concatenated spellings.
      "source-add" | "addsource" => Action::SourceAdd,
      "source-remove" | "removesource" => Action::SourceRemove,
      _ => return Err(Error::ParseError("unknown jingle action")),
    })
  }
}

impl std::fmt::Display for Action {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Action::ContentAccept => "content-accept",
      Action::ContentAdd => "content-add",
      Action::ContentModify => "content-modify",
      Action::ContentReject => "content-reject",
      Action::ContentRemove => "content-remove",
      Action::DescriptionInfo => "description-info",
      Action::SecurityInfo => "security-info",
      Action::SessionAccept => "session-accept",
      Action::SessionInfo => "session-info",
      Action::SessionInitiate => "session-initiate",
      Action::SessionTerminate => "session-terminate",
      Action::TransportAccept => "transport-accept",
      Action::TransportInfo => "transport-info",
      Action::TransportReject => "transport-reject",
      Action::TransportReplace => "transport-replace",
      Action::SourceAdd => "source-add",
      Action::SourceRemove => "source-remove",
    })
  }
}

/// The main Jingle container, to be included in an iq stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct Jingle {
  /// The action to execute on both ends.
  pub action: Action,

  /// Who the initiator is.
  pub initiator: Option<Jid>,

  /// Who the responder is.
  pub responder: Option<Jid>,

  /// Unique session identifier between two entities.
  pub sid: SessionId,

  /// A list of contents to be negotiated in this session.
  pub contents: Vec<Content>,

  /// An optional reason.
  pub reason: Option<ReasonElement>,

  /// An optional grouping.
  pub group: Option<Group>,

  /// Payloads to be included.
  pub other: Vec<Element>,
}

impl IqSetPayload for Jingle {}

impl Jingle {
  /// Create a new Jingle element.
  pub fn new(action: Action, sid: SessionId) -> Jingle {
    Jingle {
      action,
      sid,
      initiator: None,
      responder: None,
      contents: Vec::new(),
      reason: None,
      group: None,
      other: Vec::new(),
    }
  }

  pub fn with_initiator(mut self, initiator: Jid) -> Jingle {
    self.initiator = Some(initiator);
    self
  }

  pub fn with_responder(mut self, responder: Jid) -> Jingle {
    self.responder = Some(responder);
    self
  }

  pub fn add_content(mut self, content: Content) -> Jingle {
    self.contents.push(content);
    self
  }

  pub fn set_reason(mut self, reason: ReasonElement) -> Jingle {
    self.reason = Some(reason);
    self
  }

  pub fn set_group(mut self, group: Group) -> Jingle {
    self.group = Some(group);
    self
  }
}

impl TryFrom<Element> for Jingle {
  type Error = Error;

  fn try_from(root: Element) -> Result<Jingle, Error> {
    if !root.is("jingle", JINGLE) {
      return Err(Error::ParseError("not a jingle element"));
    }
    let mut jingle = Jingle {
      action: root
        .attr("action")
        .ok_or(Error::ParseError("jingle element without action"))?
        .parse()?,
      initiator: root
        .attr("initiator")
        .map(|s| s.parse())
        .transpose()
        .map_err(Error::JidParseError)?,
      responder: root
        .attr("responder")
        .map(|s| s.parse())
        .transpose()
        .map_err(Error::JidParseError)?,
      sid: SessionId(
        root
          .attr("sid")
          .ok_or(Error::ParseError("jingle element without sid"))?
          .to_owned(),
      ),
      contents: vec![],
      reason: None,
      group: None,
      other: vec![],
    };

    for child in root.children().cloned() {
      if child.is("content", JINGLE) {
        jingle.contents.push(Content::try_from(child)?);
      }
      else if child.is("reason", JINGLE) {
        if jingle.reason.is_some() {
          return Err(Error::ParseError("jingle must not have more than one reason"));
        }
        jingle.reason = Some(ReasonElement::try_from(child)?);
      }
      else if child.is("group", JINGLE_GROUPING) {
        if jingle.group.is_some() {
          return Err(Error::ParseError("jingle must not have more than one grouping"));
        }
        jingle.group = Some(Group::try_from(child)?);
      }
      else {
        jingle.other.push(child);
      }
    }

    Ok(jingle)
  }
}

impl From<Jingle> for Element {
  fn from(jingle: Jingle) -> Element {
    Element::builder("jingle", JINGLE)
      .attr("action", jingle.action.to_string())
      .attr("initiator", jingle.initiator.map(|jid| jid.to_string()))
      .attr("responder", jingle.responder.map(|jid| jid.to_string()))
      .attr("sid", jingle.sid.0)
      .append_all(jingle.contents.into_iter().map(Element::from))
      .append_all(jingle.reason.map(Element::from))
      .append_all(jingle.group.map(Element::from))
      .append_all(jingle.other)
      .build()
  }
}

/// Enum wrapping the description variants the focus understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Description {
  /// Jingle RTP Sessions (XEP-0167) description.
  Rtp(RtpDescription),

  /// To be used for any description that isn't known at compile-time.
  Unknown(Element),
}

impl TryFrom<Element> for Description {
  type Error = Error;

  fn try_from(elem: Element) -> Result<Description, Error> {
    Ok(if elem.is("description", JINGLE_RTP) {
      Description::Rtp(RtpDescription::try_from(elem)?)
    }
    else {
      Description::Unknown(elem)
    })
  }
}

impl From<RtpDescription> for Description {
  fn from(description: RtpDescription) -> Description {
    Description::Rtp(description)
  }
}

impl From<Description> for Element {
  fn from(description: Description) -> Element {
    match description {
      Description::Rtp(description) => description.into(),
      Description::Unknown(elem) => elem,
    }
  }
}

/// Enum wrapping the transport variants the focus understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Transport {
  /// Jingle ICE-UDP (XEP-0176) transport.
  IceUdp(IceUdpTransport),

  /// To be used for any transport that isn't known at compile-time.
  Unknown(Element),
}

impl TryFrom<Element> for Transport {
  type Error = Error;

  fn try_from(elem: Element) -> Result<Transport, Error> {
    Ok(if elem.is("transport", JINGLE_ICE_UDP) {
      Transport::IceUdp(IceUdpTransport::try_from(elem)?)
    }
    else {
      Transport::Unknown(elem)
    })
  }
}

impl From<IceUdpTransport> for Transport {
  fn from(transport: IceUdpTransport) -> Transport {
    Transport::IceUdp(transport)
  }
}

impl From<Transport> for Element {
  fn from(transport: Transport) -> Element {
    match transport {
      Transport::IceUdp(transport) => transport.into(),
      Transport::Unknown(elem) => elem,
    }
  }
}

/// Describes a session's content; there can be multiple contents in one
/// session.
#[derive(Debug, Clone, PartialEq)]
pub struct Content {
  /// Who created this content.
  pub creator: Option<Creator>,

  /// How the content definition is to be interpreted by the recipient.
  pub disposition: Disposition,

  /// A per-session unique identifier for this content.
  pub name: ContentId,

  /// Who can send data for this content.
  pub senders: Senders,

  /// What to send.
  pub description: Option<Description>,

  /// How to send it.
  pub transport: Option<Transport>,
}

impl Content {
  /// Create a new content.
  pub fn new(creator: Creator, name: ContentId) -> Content {
    Content {
      creator: Some(creator),
      name,
      disposition: Disposition::Session,
      senders: Senders::Both,
      description: None,
      transport: None,
    }
  }

  pub fn with_senders(mut self, senders: Senders) -> Content {
    self.senders = senders;
    self
  }

  pub fn with_description<D: Into<Description>>(mut self, description: D) -> Content {
    self.description = Some(description.into());
    self
  }

  pub fn with_transport<T: Into<Transport>>(mut self, transport: T) -> Content {
    self.transport = Some(transport.into());
    self
  }
}

impl TryFrom<Element> for Content {
  type Error = Error;

  fn try_from(root: Element) -> Result<Content, Error> {
    if !root.is("content", JINGLE) {
      return Err(Error::ParseError("not a jingle content element"));
    }
    let mut content = Content {
      creator: root.attr("creator").map(|s| s.parse()).transpose()?,
      disposition: root
        .attr("disposition")
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(Disposition::Session),
      name: ContentId(
        root
          .attr("name")
          .ok_or(Error::ParseError("content element without name"))?
          .to_owned(),
      ),
      senders: root
        .attr("senders")
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(Senders::Both),
      description: None,
      transport: None,
    };
    for child in root.children().cloned() {
      if child.is("description", Any) {
        content.description = Some(Description::try_from(child)?);
      }
      else if child.is("transport", Any) {
        content.transport = Some(Transport::try_from(child)?);
      }
    }
    Ok(content)
  }
}

impl From<Content> for Element {
  fn from(content: Content) -> Element {
    Element::builder("content", JINGLE)
      .attr("creator", content.creator)
      .attr("disposition", content.disposition)
      .attr("name", content.name.0)
      .attr("senders", content.senders)
      .append_all(content.description.map(Element::from))
      .append_all(content.transport.map(Element::from))
      .build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_source_add_alias() {
    assert_eq!("addsource".parse::<Action>().unwrap(), Action::SourceAdd);
    assert_eq!("source-add".parse::<Action>().unwrap(), Action::SourceAdd);
    assert_eq!(
      "removesource".parse::<Action>().unwrap(),
      Action::SourceRemove
    );
  }

  #[test]
  fn parse_jingle() {
    let elem: Element = "<jingle action='session-initiate' sid='abc123' xmlns='urn:xmpp:jingle:1'>
    <content creator='initiator' name='audio'/>
</jingle>"
      .parse()
      .unwrap();
    let jingle = Jingle::try_from(elem).unwrap();
    assert_eq!(jingle.action, Action::SessionInitiate);
    assert_eq!(jingle.sid.0, "abc123");
    assert_eq!(jingle.contents.len(), 1);
    assert_eq!(jingle.contents[0].name.0, "audio");
  }

  #[test]
  fn missing_action_fails() {
    let elem: Element = "<jingle sid='abc' xmlns='urn:xmpp:jingle:1'/>".parse().unwrap();
    assert!(Jingle::try_from(elem).is_err());
  }

  #[test]
  fn jingle_round_trip() {
    let jingle = Jingle::new(Action::SourceAdd, SessionId("s1".to_owned()))
      .add_content(Content::new(Creator::Initiator, ContentId("video".to_owned())));
    let elem = Element::from(jingle.clone());
    assert_eq!(Jingle::try_from(elem).unwrap(), jingle);
  }
}
