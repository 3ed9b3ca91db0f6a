use xmpp_parsers::{
  jingle_rtp::{PayloadType, RtcpMux},
  jingle_rtp_hdrext::RtpHdrext,
  ns::{JINGLE_RTP, JINGLE_RTP_HDREXT, JINGLE_SSMA},
  Element, Error,
};

use crate::jingle_ssma::{Group, Source};

/// Wrapper element describing an RTP session, extended with the Jitsi Meet
/// source signaling children.
#[derive(Debug, Clone, PartialEq)]
pub struct Description {
  /// Media type of this stream (`audio` or `video`).
  pub media: String,

  /// List of encodings that can be used for this RTP stream.
  pub payload_types: Vec<PayloadType>,

  /// RTP and RTCP multiplexed on a single port (RFC 5761).
  pub rtcp_mux: Option<RtcpMux>,

  /// List of ssrc-group.
  pub ssrc_groups: Vec<Group>,

  /// List of ssrc.
  pub ssrcs: Vec<Source>,

  /// List of header extensions.
  pub hdrexts: Vec<RtpHdrext>,
}

impl Description {
  pub fn new(media: String) -> Description {
    Description {
      media,
      payload_types: Vec::new(),
      rtcp_mux: None,
      ssrc_groups: Vec::new(),
      ssrcs: Vec::new(),
      hdrexts: Vec::new(),
    }
  }
}

impl TryFrom<Element> for Description {
  type Error = Error;

  fn try_from(root: Element) -> Result<Description, Error> {
    if !root.is("description", JINGLE_RTP) {
      return Err(Error::ParseError("not a RTP description element"));
    }
    let mut description = Description::new(
      root
        .attr("media")
        .ok_or(Error::ParseError("description element without media"))?
        .to_owned(),
    );
    for child in root.children().cloned() {
      if child.is("payload-type", JINGLE_RTP) {
        description.payload_types.push(PayloadType::try_from(child)?);
      }
      else if child.is("rtcp-mux", JINGLE_RTP) {
        description.rtcp_mux = Some(RtcpMux::try_from(child)?);
      }
      else if child.is("ssrc-group", JINGLE_SSMA) {
        description.ssrc_groups.push(Group::try_from(child)?);
      }
      else if child.is("source", JINGLE_SSMA) {
        description.ssrcs.push(Source::try_from(child)?);
      }
      else if child.is("rtp-hdrext", JINGLE_RTP_HDREXT) {
        description.hdrexts.push(RtpHdrext::try_from(child)?);
      }
    }
    Ok(description)
  }
}

impl From<Description> for Element {
  fn from(description: Description) -> Element {
    Element::builder("description", JINGLE_RTP)
      .attr("media", description.media)
      .append_all(description.payload_types.into_iter().map(Element::from))
      .append_all(description.rtcp_mux.map(Element::from))
      .append_all(description.ssrc_groups.into_iter().map(Element::from))
      .append_all(description.ssrcs.into_iter().map(Element::from))
      .append_all(description.hdrexts.into_iter().map(Element::from))
      .build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_description() {
    let elem: Element = "<description media='audio' xmlns='urn:xmpp:jingle:apps:rtp:1'>
    <payload-type id='111' name='opus' clockrate='48000' channels='2'/>
    <rtcp-mux/>
    <source ssrc='42' xmlns='urn:xmpp:jingle:apps:rtp:ssma:0'/>
</description>"
      .parse()
      .unwrap();
    let description = Description::try_from(elem).unwrap();
    assert_eq!(description.media, "audio");
    assert_eq!(description.payload_types.len(), 1);
    assert!(description.rtcp_mux.is_some());
    assert_eq!(description.ssrcs.len(), 1);
    assert_eq!(description.ssrcs[0].id, 42);
  }
}
