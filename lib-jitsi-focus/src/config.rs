use std::time::Duration;

use crate::bridge::selector::SelectionStrategy;

/// Engine configuration. The daemon fills this in from its command line;
/// the defaults follow common Jitsi Meet deployments.
#[derive(Debug, Clone)]
pub struct FocusConfig {
  /// The region this focus runs in, advertised to bridges.
  pub region: Option<String>,

  /// Sources one endpoint may advertise before the excess is dropped.
  pub max_ssrcs_per_endpoint: usize,

  /// Ask bridges to rewrite ssrcs for endpoints that understand named
  /// sources, keeping the receive-side ssrc space small.
  pub use_ssrc_rewriting: bool,

  /// The bridge selection strategy used for new conferences.
  pub selection_strategy: SelectionStrategy,

  /// How long a freshly-allocated endpoint keeps counting towards a
  /// bridge's corrected stress.
  pub participant_rampup_interval: Duration,

  /// Stress added per recently-allocated endpoint.
  pub stress_per_new_endpoint: f64,

  /// How long a failed bridge is kept out of selection.
  pub bridge_failure_cooldown: Duration,

  /// How long to wait for a response to an outbound IQ.
  pub iq_timeout: Duration,

  /// How long a Jibri may stay Pending before the attempt counts as failed.
  pub jibri_pending_timeout: Duration,

  /// How many times a failed Jibri attempt is retried with a fresh
  /// instance.
  pub jibri_num_retries: u32,

  /// How long an authentication session survives without activity.
  pub authentication_lifetime: Duration,

  /// XMPP domain whose users may authenticate by merely owning a jid on it.
  pub trusted_domain: Option<String>,

  /// Whether authentication sessions outlive their conference.
  pub enable_auto_login: bool,
}

impl Default for FocusConfig {
  fn default() -> FocusConfig {
    FocusConfig {
      region: None,
      max_ssrcs_per_endpoint: 20,
      use_ssrc_rewriting: false,
      selection_strategy: SelectionStrategy::RegionBased,
      participant_rampup_interval: Duration::from_secs(20),
      stress_per_new_endpoint: 0.02,
      bridge_failure_cooldown: Duration::from_secs(60),
      iq_timeout: Duration::from_secs(15),
      jibri_pending_timeout: Duration::from_secs(90),
      jibri_num_retries: 2,
      authentication_lifetime: Duration::from_secs(24 * 60 * 60),
      trusted_domain: None,
      enable_auto_login: true,
    }
  }
}
