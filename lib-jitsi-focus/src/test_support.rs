use std::{collections::VecDeque, sync::Mutex};

use anyhow::Result;
use async_trait::async_trait;
use xmpp_parsers::{iq::Iq, Element};

use crate::xmpp::router::{IqResponse, IqSender};

/// Records outbound stanzas and answers IQs from a canned queue. An empty
/// queue answers with an empty result.
#[derive(Default)]
pub(crate) struct MockSender {
  pub sent: Mutex<Vec<Element>>,
  pub responses: Mutex<VecDeque<IqResponse>>,
}

impl MockSender {
  pub fn new() -> MockSender {
    Default::default()
  }

  pub fn push_response(&self, response: IqResponse) {
    self.responses.lock().unwrap().push_back(response);
  }

  pub fn sent_stanzas(&self) -> Vec<Element> {
    self.sent.lock().unwrap().clone()
  }

  pub fn sent_count(&self) -> usize {
    self.sent.lock().unwrap().len()
  }
}

#[async_trait]
impl IqSender for MockSender {
  async fn send_iq(&self, iq: Iq) -> Result<IqResponse> {
    self.sent.lock().unwrap().push(iq.into());
    let canned = self.responses.lock().unwrap().pop_front();
    Ok(canned.unwrap_or(IqResponse::Result(None)))
  }

  async fn send_stanza(&self, stanza: Element) -> Result<()> {
    self.sent.lock().unwrap().push(stanza);
    Ok(())
  }
}
