/// Feature advertised by endpoints that understand source names.
pub const SOURCE_NAMES: &str = "http://jitsi.org/source-name";

/// Feature advertised by endpoints that accept sources as compact JSON.
pub const JSON_SOURCES: &str = "http://jitsi.org/json-encoded-sources";

/// Feature advertised by endpoints that can receive several video streams
/// from the same peer.
pub const RECEIVE_MULTIPLE_STREAMS: &str = "http://jitsi.org/receive-multiple-video-streams";

/// Feature advertised by endpoints that can receive simulcast.
pub const SIMULCAST: &str = "http://jitsi.org/simulcast";
