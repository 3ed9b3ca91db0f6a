use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
  time::Duration,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::{
  sync::{mpsc, oneshot},
  time,
};
use tracing::{debug, warn};
use xmpp_parsers::{
  iq::{Iq, IqType},
  ns,
  stanza_error::StanzaError,
  Element,
};

use uuid::Uuid;

use crate::xmpp::connection::StanzaFilter;

/// A stanza id for an outbound focus IQ. The prefix makes our requests easy
/// to pick out of server-side logs.
pub(crate) fn unique_iq_id() -> String {
  format!("focus-{}", Uuid::new_v4())
}

/// The outcome of an awaited IQ. A timeout is surfaced as an error from
/// [`IqSender::send_iq`], never as a silent success.
#[derive(Debug, Clone)]
pub enum IqResponse {
  Result(Option<Element>),
  Error(StanzaError),
}

/// The slice of the XMPP connection the focus components talk to.
#[async_trait]
pub trait IqSender: Send + Sync {
  /// Sends an IQ and awaits the matching result or error.
  async fn send_iq(&self, iq: Iq) -> Result<IqResponse>;

  /// Sends a stanza without waiting for anything.
  async fn send_stanza(&self, stanza: Element) -> Result<()>;
}

/// Matches outbound IQs to their responses by stanza id.
#[derive(Clone)]
pub struct IqRouter {
  tx: mpsc::Sender<Element>,
  pending: Arc<Mutex<HashMap<String, oneshot::Sender<IqResponse>>>>,
  timeout: Duration,
}

impl IqRouter {
  pub fn new(tx: mpsc::Sender<Element>, timeout: Duration) -> IqRouter {
    IqRouter {
      tx,
      pending: Arc::new(Mutex::new(HashMap::new())),
      timeout,
    }
  }
}

#[async_trait]
impl IqSender for IqRouter {
  async fn send_iq(&self, iq: Iq) -> Result<IqResponse> {
    let id = iq.id.clone();
    let (response_tx, response_rx) = oneshot::channel();
    {
      let mut pending = self.pending.lock().unwrap();
      if pending.insert(id.clone(), response_tx).is_some() {
        warn!(id, "reusing an IQ id with a response still pending");
      }
    }
    self.tx.send(iq.into()).await?;
    match time::timeout(self.timeout, response_rx).await {
      Ok(Ok(response)) => Ok(response),
      Ok(Err(_)) => {
        self.pending.lock().unwrap().remove(&id);
        bail!("IQ {} dropped without a response", id)
      },
      Err(_) => {
        self.pending.lock().unwrap().remove(&id);
        bail!("timed out waiting for response to IQ {}", id)
      },
    }
  }

  async fn send_stanza(&self, stanza: Element) -> Result<()> {
    self.tx.send(stanza).await?;
    Ok(())
  }
}

#[async_trait]
impl StanzaFilter for IqRouter {
  fn name(&self) -> &'static str {
    "iq-router"
  }

  fn filter(&self, element: &Element) -> bool {
    element.is("iq", ns::DEFAULT_NS)
      && matches!(element.attr("type"), Some("result") | Some("error"))
      && element
        .attr("id")
        .map(|id| self.pending.lock().unwrap().contains_key(id))
        .unwrap_or_default()
  }

  async fn take(&self, element: Element) -> Result<()> {
    let iq = Iq::try_from(element)?;
    let response = match iq.payload {
      IqType::Result(payload) => IqResponse::Result(payload),
      IqType::Error(error) => IqResponse::Error(error),
      _ => return Ok(()),
    };
    let tx = self
      .pending
      .lock()
      .unwrap()
      .remove(&iq.id)
      .ok_or_else(|| anyhow!("response to unknown IQ {}", iq.id))?;
    if tx.send(response).is_err() {
      debug!(id = iq.id, "IQ waiter went away before the response arrived");
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use xmpp_parsers::{disco::DiscoInfoQuery, Jid};

  fn request(id: &str) -> Iq {
    Iq::from_get(id, DiscoInfoQuery { node: None })
      .with_to(Jid::Bare("server.example.com".parse().unwrap()))
  }

  #[tokio::test]
  async fn matches_response_by_id() {
    let (tx, mut rx) = mpsc::channel(8);
    let router = IqRouter::new(tx, Duration::from_secs(1));
    let send = {
      let router = router.clone();
      tokio::spawn(async move { router.send_iq(request("iq-1")).await })
    };
    let sent = rx.recv().await.unwrap();
    assert_eq!(sent.attr("id"), Some("iq-1"));
    let response: Element =
      "<iq xmlns='jabber:client' type='result' id='iq-1'/>".parse().unwrap();
    assert!(router.filter(&response));
    router.take(response).await.unwrap();
    assert!(matches!(
      send.await.unwrap().unwrap(),
      IqResponse::Result(None)
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn times_out_without_response() {
    let (tx, _rx) = mpsc::channel(8);
    let router = IqRouter::new(tx, Duration::from_secs(5));
    let result = router.send_iq(request("iq-2")).await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn ignores_unrelated_stanzas() {
    let (tx, _rx) = mpsc::channel(8);
    let router = IqRouter::new(tx, Duration::from_secs(1));
    let unrelated: Element =
      "<iq xmlns='jabber:client' type='result' id='nobody-waiting'/>".parse().unwrap();
    assert!(!router.filter(&unrelated));
  }
}
