/// Conference IQs exchanged between clients and the focus.
pub const JITSI_FOCUS: &str = "http://jitsi.org/protocol/focus";

/// Miscellaneous Jitsi Meet extensions (ssrc-info, json-message).
pub const JITSI_MEET: &str = "http://jitsi.org/jitmeet";

/// Statistics published by bridges in their brewery MUC presence.
pub const JITSI_COLIBRI: &str = "http://jitsi.org/protocol/colibri";

/// Channel allocation IQs exchanged between the focus and bridges.
pub const COLIBRI2: &str = "jitsi:colibri2";

/// Jibri control IQs and status presence extensions.
pub const JIBRI: &str = "http://jitsi.org/protocol/jibri";
