use xmpp_parsers::{Element, Error};

use crate::{ns::JITSI_COLIBRI, parse_bool};

/// The `<stats/>` presence extension published by bridges in their brewery
/// MUC. Individual values are free-form name/value pairs; the accessors
/// below cover the statistics the focus consumes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BridgeStats {
  pub stats: Vec<Stat>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
  pub name: String,
  pub value: String,
}

impl BridgeStats {
  pub fn new() -> BridgeStats {
    Default::default()
  }

  pub fn with_stat(mut self, name: &str, value: impl ToString) -> BridgeStats {
    self.stats.push(Stat {
      name: name.to_owned(),
      value: value.to_string(),
    });
    self
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .stats
      .iter()
      .find(|stat| stat.name == name)
      .map(|stat| stat.value.as_str())
  }

  /// The load the bridge reports, in [0, 1].
  pub fn stress_level(&self) -> Option<f64> {
    self.get("stress-level").and_then(|value| value.parse().ok())
  }

  pub fn region(&self) -> Option<&str> {
    self.get("region")
  }

  pub fn version(&self) -> Option<&str> {
    self.get("version")
  }

  pub fn relay_id(&self) -> Option<&str> {
    self.get("relay-id")
  }

  pub fn healthy(&self) -> bool {
    self
      .get("healthy")
      .and_then(|value| parse_bool(value).ok())
      .unwrap_or(true)
  }

  pub fn drain(&self) -> bool {
    self
      .get("drain")
      .and_then(|value| parse_bool(value).ok())
      .unwrap_or_default()
  }

  pub fn graceful_shutdown(&self) -> bool {
    self
      .get("graceful-shutdown")
      .and_then(|value| parse_bool(value).ok())
      .unwrap_or_default()
  }
}

impl TryFrom<Element> for BridgeStats {
  type Error = Error;

  fn try_from(root: Element) -> Result<BridgeStats, Error> {
    if !root.is("stats", JITSI_COLIBRI) {
      return Err(Error::ParseError("not a stats element"));
    }
    let mut stats = BridgeStats::new();
    for child in root.children() {
      if child.is("stat", JITSI_COLIBRI) {
        let name = child
          .attr("name")
          .ok_or(Error::ParseError("stat element without name"))?;
        let value = child
          .attr("value")
          .ok_or(Error::ParseError("stat element without value"))?;
        stats.stats.push(Stat {
          name: name.to_owned(),
          value: value.to_owned(),
        });
      }
    }
    Ok(stats)
  }
}

impl From<BridgeStats> for Element {
  fn from(stats: BridgeStats) -> Element {
    Element::builder("stats", JITSI_COLIBRI)
      .append_all(stats.stats.into_iter().map(|stat| {
        Element::builder("stat", JITSI_COLIBRI)
          .attr("name", stat.name)
          .attr("value", stat.value)
          .build()
      }))
      .build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_stats() {
    let elem: Element = "<stats xmlns='http://jitsi.org/protocol/colibri'>
    <stat name='stress-level' value='0.25'/>
    <stat name='region' value='eu-west'/>
    <stat name='version' value='2.3.12'/>
    <stat name='relay-id' value='bridge1'/>
    <stat name='drain' value='false'/>
</stats>"
      .parse()
      .unwrap();
    let stats = BridgeStats::try_from(elem).unwrap();
    assert_eq!(stats.stress_level(), Some(0.25));
    assert_eq!(stats.region(), Some("eu-west"));
    assert_eq!(stats.version(), Some("2.3.12"));
    assert_eq!(stats.relay_id(), Some("bridge1"));
    assert!(!stats.drain());
    assert!(!stats.graceful_shutdown());
    assert!(stats.healthy());
  }

  #[test]
  fn build_stats() {
    let stats = BridgeStats::new()
      .with_stat("stress-level", 0.5)
      .with_stat("graceful-shutdown", true);
    let elem = Element::from(stats);
    let parsed = BridgeStats::try_from(elem).unwrap();
    assert_eq!(parsed.stress_level(), Some(0.5));
    assert!(parsed.graceful_shutdown());
  }
}
