use xmpp_parsers::{Element, Error};

use crate::ns::JITSI_MEET;

/// Wrapper carrying an opaque JSON payload, used by Jitsi Meet to ship
/// compact source descriptions inside Jingle IQs.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonMessage {
  pub json: String,
}

impl JsonMessage {
  pub fn new(json: impl Into<String>) -> JsonMessage {
    JsonMessage { json: json.into() }
  }
}

impl TryFrom<Element> for JsonMessage {
  type Error = Error;

  fn try_from(root: Element) -> Result<JsonMessage, Error> {
    if !root.is("json-message", JITSI_MEET) {
      return Err(Error::ParseError("not a json-message element"));
    }
    Ok(JsonMessage { json: root.text() })
  }
}

impl From<JsonMessage> for Element {
  fn from(message: JsonMessage) -> Element {
    Element::builder("json-message", JITSI_MEET)
      .append(message.json)
      .build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trip() {
    let message = JsonMessage::new(r#"{"sources":{}}"#);
    let elem = Element::from(message.clone());
    assert_eq!(JsonMessage::try_from(elem).unwrap(), message);
  }
}
