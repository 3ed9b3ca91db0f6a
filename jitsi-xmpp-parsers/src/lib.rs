pub mod colibri2;
pub mod colibri_stats;
pub mod conference_iq;
pub mod jibri_iq;
pub mod jibri_status;
pub mod jingle;
pub mod jingle_ice_udp;
pub mod jingle_rtp;
pub mod jingle_ssma;
pub mod json_message;
pub mod ns;

pub(crate) fn parse_bool(s: &str) -> Result<bool, xmpp_parsers::Error> {
  match s {
    "true" | "1" => Ok(true),
    "false" | "0" => Ok(false),
    _ => Err(xmpp_parsers::Error::ParseError("invalid boolean attribute")),
  }
}
