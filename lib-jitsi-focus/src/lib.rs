pub mod auth;
pub mod bridge;
pub mod colibri;
pub mod conference;
pub mod conference_iq;
pub mod config;
pub mod error;
pub mod focus;
pub mod jibri;
pub mod jingle;
pub mod load_redistributor;
pub mod participant;
mod pinger;
pub mod source;
pub mod source_signaling;
pub mod stats;
mod task_queue;
#[cfg(test)]
mod test_support;
pub mod xmpp;

pub use xmpp_parsers::jingle::Reason;

pub use crate::{
  auth::AuthenticationAuthority,
  conference::JitsiConference,
  conference_iq::ConferenceIqHandler,
  config::FocusConfig,
  focus::{FocusManager, JibriIqHandler},
  jingle::JingleIqHandler,
  load_redistributor::{LoadRedistributor, MoveError, MoveResult},
  stats::FocusStats,
  xmpp::connection::{Authentication, Connection, StanzaFilter},
  xmpp::router::{IqRouter, IqSender},
};

#[cfg(feature = "tracing-subscriber")]
pub fn init_tracing(level: tracing::Level) {
  tracing_subscriber::fmt()
    .with_max_level(level)
    .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
    .with_target(false)
    .init();
}
