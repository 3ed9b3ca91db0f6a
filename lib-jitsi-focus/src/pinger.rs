use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;
use xmpp_parsers::{
  iq::{Iq, IqType},
  ns,
  Element, FullJid, Jid,
};

use crate::{stats::FocusStats, xmpp::connection::StanzaFilter};

/// Answers XEP-0199 pings so the server keeps the stream open, and counts
/// them as a liveness signal for the admin surface.
#[derive(Debug)]
pub(crate) struct Pinger {
  jid: FullJid,
  tx: mpsc::Sender<Element>,
  stats: Arc<FocusStats>,
}

impl Pinger {
  pub(crate) fn new(jid: FullJid, tx: mpsc::Sender<Element>, stats: Arc<FocusStats>) -> Pinger {
    Pinger { jid, tx, stats }
  }
}

#[async_trait]
impl StanzaFilter for Pinger {
  fn name(&self) -> &'static str {
    "pinger"
  }

  fn filter(&self, element: &Element) -> bool {
    element.is("iq", ns::DEFAULT_NS) && element.has_child("ping", ns::PING)
  }

  async fn take(&self, element: Element) -> Result<()> {
    let iq = Iq::try_from(element)?;
    if !matches!(iq.payload, IqType::Get(_)) {
      return Ok(());
    }
    let from = iq.from.ok_or_else(|| anyhow!("ping without a from jid"))?;
    trace!(from = %from, "answering ping");
    let result_iq =
      Iq::empty_result(from, iq.id).with_from(Jid::Full(self.jid.clone()));
    self.tx.send(result_iq.into()).await?;
    FocusStats::bump(&self.stats.pings_answered);
    Ok(())
  }
}
