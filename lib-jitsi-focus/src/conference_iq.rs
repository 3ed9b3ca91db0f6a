use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use jitsi_xmpp_parsers::{conference_iq::ConferenceIq, ns::JITSI_FOCUS};
use tracing::{debug, info};
use xmpp_parsers::{
  iq::{Iq, IqType},
  ns,
  stanza_error::StanzaError,
  Element, FullJid, Jid,
};

use crate::{error::StanzaErrorKind, focus::FocusManager, xmpp::connection::StanzaFilter};

/// The admission path: checks authentication, creates or joins the
/// conference, and hands the client the focus details.
pub struct ConferenceIqHandler {
  manager: Arc<FocusManager>,
  focus_jid: FullJid,
}

impl ConferenceIqHandler {
  pub fn new(manager: Arc<FocusManager>, focus_jid: FullJid) -> ConferenceIqHandler {
    ConferenceIqHandler { manager, focus_jid }
  }

  /// The same logic backs the IQ path and the HTTP conference-request
  /// surface.
  pub async fn handle_conference_request(
    &self,
    request: &ConferenceIq,
    from: &Jid,
  ) -> Result<ConferenceIq, StanzaError> {
    let room_exists = self.manager.conference_exists(&request.room).await;
    let session_id = self.manager.auth().verify(request, from, room_exists)?;

    self
      .manager
      .conference_request(request.room.clone())
      .await
      .map_err(|e| {
        debug!("conference creation failed: {:?}", e);
        StanzaErrorKind::InternalServerError.to_stanza_error("failed to create conference")
      })?;

    let identity = session_id
      .as_deref()
      .and_then(|session_id| self.manager.auth().get_session(session_id))
      .map(|session| session.user_identity);

    info!(room = %request.room, from = %from, "admitted to conference");
    let mut response = ConferenceIq::new(request.room.clone());
    response.ready = Some(true);
    response.focus_jid = Some(self.focus_jid.to_string());
    response.session_id = session_id;
    response.identity = identity;
    Ok(response)
  }
}

#[async_trait]
impl StanzaFilter for ConferenceIqHandler {
  fn name(&self) -> &'static str {
    "conference-iq"
  }

  fn filter(&self, element: &Element) -> bool {
    element.is("iq", ns::DEFAULT_NS)
      && element.attr("type") == Some("set")
      && element
        .children()
        .any(|child| child.is("conference", JITSI_FOCUS))
  }

  async fn take(&self, element: Element) -> Result<()> {
    let iq = Iq::try_from(element)?;
    let from = match iq.from.clone() {
      Some(from) => from,
      None => return Ok(()),
    };
    let payload = match iq.payload {
      IqType::Set(payload) => payload,
      _ => return Ok(()),
    };
    let response_iq = match ConferenceIq::try_from(payload) {
      Ok(request) => match self.handle_conference_request(&request, &from).await {
        Ok(response) => Iq::from_result(iq.id, Some(response)),
        Err(error) => Iq::from_error(iq.id, error),
      },
      Err(e) => {
        debug!("malformed conference IQ: {:?}", e);
        Iq::from_error(
          iq.id,
          StanzaErrorKind::BadRequest.to_stanza_error("malformed conference IQ"),
        )
      },
    };
    let response_iq = response_iq
      .with_to(from)
      .with_from(Jid::Full(self.focus_jid.clone()));
    self.manager_sender().send_stanza(response_iq.into()).await
  }
}

impl ConferenceIqHandler {
  fn manager_sender(&self) -> Arc<dyn crate::xmpp::router::IqSender> {
    self.manager.sender()
  }
}
