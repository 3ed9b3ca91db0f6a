use xmpp_parsers::{
  jingle_dtls_srtp::Fingerprint,
  jingle_ice_udp::Candidate,
  ns::{JINGLE_DTLS, JINGLE_ICE_UDP},
  Element, Error,
};

use crate::ns::JITSI_COLIBRI;

/// Wrapper element for an ICE-UDP transport, extended with the Colibri
/// WebSocket advertisement used by Jitsi Meet bridges.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transport {
  /// A Password as defined in ICE-CORE.
  pub pwd: Option<String>,

  /// A User Fragment as defined in ICE-CORE.
  pub ufrag: Option<String>,

  /// List of candidates for this ICE-UDP session.
  pub candidates: Vec<Candidate>,

  /// Fingerprint of the key used for the DTLS handshake.
  pub fingerprint: Option<Fingerprint>,

  /// Details of the Colibri WebSocket.
  pub web_socket: Option<WebSocket>,
}

impl Transport {
  pub fn new() -> Transport {
    Default::default()
  }

  pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
    self.fingerprint = Some(fingerprint);
    self
  }
}

impl TryFrom<Element> for Transport {
  type Error = Error;

  fn try_from(root: Element) -> Result<Transport, Error> {
    if !root.is("transport", JINGLE_ICE_UDP) {
      return Err(Error::ParseError("not an ICE-UDP transport element"));
    }
    let mut transport = Transport::new();
    transport.pwd = root.attr("pwd").map(ToOwned::to_owned);
    transport.ufrag = root.attr("ufrag").map(ToOwned::to_owned);
    for child in root.children().cloned() {
      if child.is("candidate", JINGLE_ICE_UDP) {
        transport.candidates.push(Candidate::try_from(child)?);
      }
      else if child.is("fingerprint", JINGLE_DTLS) {
        transport.fingerprint = Some(Fingerprint::try_from(child)?);
      }
      else if child.is("web-socket", JITSI_COLIBRI) {
        transport.web_socket = Some(WebSocket::try_from(child)?);
      }
    }
    Ok(transport)
  }
}

impl From<Transport> for Element {
  fn from(transport: Transport) -> Element {
    Element::builder("transport", JINGLE_ICE_UDP)
      .attr("pwd", transport.pwd)
      .attr("ufrag", transport.ufrag)
      .append_all(transport.candidates.into_iter().map(Element::from))
      .append_all(transport.fingerprint.map(Element::from))
      .append_all(transport.web_socket.map(Element::from))
      .build()
  }
}

/// Colibri WebSocket details.
#[derive(Debug, Clone, PartialEq)]
pub struct WebSocket {
  /// The WebSocket URL.
  pub url: String,
}

impl TryFrom<Element> for WebSocket {
  type Error = Error;

  fn try_from(root: Element) -> Result<WebSocket, Error> {
    if !root.is("web-socket", JITSI_COLIBRI) {
      return Err(Error::ParseError("not a web-socket element"));
    }
    Ok(WebSocket {
      url: root
        .attr("url")
        .ok_or(Error::ParseError("web-socket element without url"))?
        .to_owned(),
    })
  }
}

impl From<WebSocket> for Element {
  fn from(web_socket: WebSocket) -> Element {
    Element::builder("web-socket", JITSI_COLIBRI)
      .attr("url", web_socket.url)
      .build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_transport() {
    let elem: Element = "<transport ufrag='u1' pwd='p1' xmlns='urn:xmpp:jingle:transports:ice-udp:1'>
    <web-socket url='wss://bridge.example.com/colibri-ws/abc' xmlns='http://jitsi.org/protocol/colibri'/>
</transport>"
      .parse()
      .unwrap();
    let transport = Transport::try_from(elem).unwrap();
    assert_eq!(transport.ufrag.as_deref(), Some("u1"));
    assert_eq!(transport.pwd.as_deref(), Some("p1"));
    assert_eq!(
      transport.web_socket.unwrap().url,
      "wss://bridge.example.com/colibri-ws/abc"
    );
  }
}
