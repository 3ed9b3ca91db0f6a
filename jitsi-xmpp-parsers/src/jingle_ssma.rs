use std::str::FromStr;

use minidom::NSChoice::Any;
use xmpp_parsers::{ns::JINGLE_SSMA, Element, Error};

use crate::{ns::JITSI_MEET, parse_bool};

/// Source element for the ssrc SDP attribute, as produced and consumed by
/// Jitsi Meet endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
  /// The 32-bit synchronisation source identifier.
  pub id: u32,

  /// The Jitsi Meet source name (e.g. `abcd1234-v0`).
  pub name: Option<String>,

  /// The video type advertised for this source (`camera` or `desktop`).
  pub video_type: Option<String>,

  /// Whether this source was injected by a server-side entity.
  pub injected: bool,

  /// List of parameters (cname, msid) for this source.
  pub parameters: Vec<Parameter>,

  /// ssrc-info carrying the owner, added by the focus on the way out.
  pub info: Option<SsrcInfo>,
}

impl Source {
  pub fn new(id: u32) -> Source {
    Source {
      id,
      name: None,
      video_type: None,
      injected: false,
      parameters: Vec::new(),
      info: None,
    }
  }

  pub fn parameter(&self, name: &str) -> Option<&str> {
    self
      .parameters
      .iter()
      .find(|parameter| parameter.name == name)
      .and_then(|parameter| parameter.value.as_deref())
  }

  pub fn msid(&self) -> Option<&str> {
    self.parameter("msid")
  }

  pub fn cname(&self) -> Option<&str> {
    self.parameter("cname")
  }
}

impl TryFrom<Element> for Source {
  type Error = Error;

  fn try_from(root: Element) -> Result<Source, Error> {
    if !root.is("source", JINGLE_SSMA) {
      return Err(Error::ParseError("not a ssma source element"));
    }
    let id = root
      .attr("ssrc")
      .ok_or(Error::ParseError("source element without ssrc"))?
      .parse()
      .map_err(Error::ParseIntError)?;
    let mut source = Source::new(id);
    source.name = root.attr("name").map(ToOwned::to_owned);
    source.video_type = root.attr("videoType").map(ToOwned::to_owned);
    source.injected = root.attr("injected").map(parse_bool).transpose()?.unwrap_or_default();
    for child in root.children() {
      // Jicofo has historically produced parameters in the wrong namespace, so
      // accept any.
      // https://github.com/jitsi/jitsi-xmpp-extensions/issues/81
      if child.is("parameter", Any) {
        source.parameters.push(Parameter::try_from(child.clone())?);
      }
      else if child.is("ssrc-info", JITSI_MEET) {
        source.info = Some(SsrcInfo::try_from(child.clone())?);
      }
    }
    Ok(source)
  }
}

impl From<Source> for Element {
  fn from(source: Source) -> Element {
    Element::builder("source", JINGLE_SSMA)
      .attr("ssrc", source.id)
      .attr("name", source.name)
      .attr("videoType", source.video_type)
      .attr("injected", if source.injected { Some("true") } else { None })
      .append_all(source.parameters.into_iter().map(Element::from))
      .append_all(source.info.map(Element::from))
      .build()
  }
}

/// Parameter associated with a ssrc.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
  pub name: String,
  pub value: Option<String>,
}

impl TryFrom<Element> for Parameter {
  type Error = Error;

  fn try_from(root: Element) -> Result<Parameter, Error> {
    if !root.is("parameter", Any) {
      return Err(Error::ParseError("not a ssma parameter element"));
    }
    Ok(Parameter {
      name: root
        .attr("name")
        .ok_or(Error::ParseError("parameter element without name"))?
        .to_owned(),
      value: root.attr("value").map(ToOwned::to_owned),
    })
  }
}

impl From<Parameter> for Element {
  fn from(parameter: Parameter) -> Element {
    Element::builder("parameter", JINGLE_SSMA)
      .attr("name", parameter.name)
      .attr("value", parameter.value)
      .build()
  }
}

/// ssrc-info associated with a ssrc.
#[derive(Debug, Clone, PartialEq)]
pub struct SsrcInfo {
  /// The MUC occupant jid of the owner of the ssrc.
  pub owner: String,
}

impl TryFrom<Element> for SsrcInfo {
  type Error = Error;

  fn try_from(root: Element) -> Result<SsrcInfo, Error> {
    if !root.is("ssrc-info", JITSI_MEET) {
      return Err(Error::ParseError("not a ssrc-info element"));
    }
    Ok(SsrcInfo {
      owner: root
        .attr("owner")
        .ok_or(Error::ParseError("ssrc-info element without owner"))?
        .to_owned(),
    })
  }
}

impl From<SsrcInfo> for Element {
  fn from(info: SsrcInfo) -> Element {
    Element::builder("ssrc-info", JITSI_MEET)
      .attr("owner", info.owner)
      .build()
  }
}

/// The subset of RFC 5888 group semantics used by Jitsi Meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Semantics {
  /// Simulcast.
  Sim,

  /// Flow identification (RTX).
  Fid,

  /// Forward error correction.
  FecFr,
}

impl FromStr for Semantics {
  type Err = Error;

  fn from_str(s: &str) -> Result<Semantics, Error> {
    match s {
      "SIM" => Ok(Semantics::Sim),
      "FID" => Ok(Semantics::Fid),
      "FEC-FR" => Ok(Semantics::FecFr),
      _ => Err(Error::ParseError("unknown ssrc-group semantics")),
    }
  }
}

impl std::fmt::Display for Semantics {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Semantics::Sim => "SIM",
      Semantics::Fid => "FID",
      Semantics::FecFr => "FEC-FR",
    })
  }
}

/// Element grouping multiple ssrc.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
  /// The semantics of this group.
  pub semantics: Semantics,

  /// The various ssrc concerned by this group.
  pub sources: Vec<Source>,
}

impl Group {
  pub fn new(semantics: Semantics, ssrcs: impl IntoIterator<Item = u32>) -> Group {
    Group {
      semantics,
      sources: ssrcs.into_iter().map(Source::new).collect(),
    }
  }

  pub fn ssrcs(&self) -> Vec<u32> {
    self.sources.iter().map(|source| source.id).collect()
  }
}

impl TryFrom<Element> for Group {
  type Error = Error;

  fn try_from(root: Element) -> Result<Group, Error> {
    if !root.is("ssrc-group", JINGLE_SSMA) {
      return Err(Error::ParseError("not a ssrc-group element"));
    }
    let semantics = root
      .attr("semantics")
      .ok_or(Error::ParseError("ssrc-group element without semantics"))?
      .parse()?;
    let mut sources = Vec::new();
    for child in root.children() {
      if child.is("source", JINGLE_SSMA) {
        sources.push(Source::try_from(child.clone())?);
      }
    }
    Ok(Group { semantics, sources })
  }
}

impl From<Group> for Element {
  fn from(group: Group) -> Element {
    Element::builder("ssrc-group", JINGLE_SSMA)
      .attr("semantics", group.semantics.to_string())
      .append_all(group.sources.into_iter().map(Element::from))
      .build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_source() {
    let elem: Element = "<source ssrc='1656081975' name='a1b2c3d4-v0' videoType='camera' xmlns='urn:xmpp:jingle:apps:rtp:ssma:0'>
    <parameter name='cname' value='Yv/wvbCdsDW2Prgd'/>
    <parameter name='msid' value='stream-a1b2c3d4 track-v0'/>
</source>"
      .parse()
      .unwrap();
    let source = Source::try_from(elem).unwrap();
    assert_eq!(source.id, 1656081975);
    assert_eq!(source.name.as_deref(), Some("a1b2c3d4-v0"));
    assert_eq!(source.video_type.as_deref(), Some("camera"));
    assert!(!source.injected);
    assert_eq!(source.msid(), Some("stream-a1b2c3d4 track-v0"));
    assert_eq!(source.cname(), Some("Yv/wvbCdsDW2Prgd"));
  }

  #[test]
  fn parse_source_without_ssrc_fails() {
    let elem: Element = "<source xmlns='urn:xmpp:jingle:apps:rtp:ssma:0'/>"
      .parse()
      .unwrap();
    assert!(Source::try_from(elem).is_err());
  }

  #[test]
  fn source_round_trip() {
    let mut source = Source::new(12345);
    source.name = Some("a1b2c3d4-v0".to_owned());
    source.parameters.push(Parameter {
      name: "msid".to_owned(),
      value: Some("stream track".to_owned()),
    });
    source.info = Some(SsrcInfo {
      owner: "room@conference.example.com/a1b2c3d4".to_owned(),
    });
    let elem = Element::from(source.clone());
    assert_eq!(Source::try_from(elem).unwrap(), source);
  }

  #[test]
  fn parse_group() {
    let elem: Element = "<ssrc-group semantics='FID' xmlns='urn:xmpp:jingle:apps:rtp:ssma:0'>
    <source ssrc='1' xmlns='urn:xmpp:jingle:apps:rtp:ssma:0'/>
    <source ssrc='2' xmlns='urn:xmpp:jingle:apps:rtp:ssma:0'/>
</ssrc-group>"
      .parse()
      .unwrap();
    let group = Group::try_from(elem).unwrap();
    assert_eq!(group.semantics, Semantics::Fid);
    assert_eq!(group.ssrcs(), vec![1, 2]);
  }

  #[test]
  fn unknown_semantics_fails() {
    let elem: Element =
      "<ssrc-group semantics='ANAT' xmlns='urn:xmpp:jingle:apps:rtp:ssma:0'/>"
        .parse()
        .unwrap();
    assert!(Group::try_from(elem).is_err());
  }
}
