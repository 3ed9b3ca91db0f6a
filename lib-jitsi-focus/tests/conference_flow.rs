//! End-to-end flows against a scripted XMPP layer: conference admission,
//! participant invites and load moves, without a real server.

use std::{
  collections::VecDeque,
  sync::{Arc, Mutex},
  time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use jitsi_xmpp_parsers::{colibri_stats::BridgeStats, conference_iq::ConferenceIq};
use lib_jitsi_focus::{
  xmpp::router::{IqResponse, IqSender},
  ConferenceIqHandler, FocusConfig, FocusManager, FocusStats, LoadRedistributor, StanzaFilter,
};
use xmpp_parsers::{iq::Iq, BareJid, Element, FullJid, Jid};

#[derive(Default)]
struct ScriptedSender {
  sent: Mutex<Vec<Element>>,
  responses: Mutex<VecDeque<IqResponse>>,
}

impl ScriptedSender {
  fn new() -> Arc<ScriptedSender> {
    Arc::new(Default::default())
  }

  fn sent(&self) -> Vec<Element> {
    self.sent.lock().unwrap().clone()
  }
}

#[async_trait]
impl IqSender for ScriptedSender {
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

fn focus_jid() -> FullJid {
  "focus@auth.example.com/focus".parse().unwrap()
}

fn room() -> BareJid {
  "r1@conference.example.com".parse().unwrap()
}

fn config() -> FocusConfig {
  FocusConfig {
    trusted_domain: Some("auth.example.com".to_owned()),
    ..Default::default()
  }
}

fn register_bridge(manager: &FocusManager, name: &str) {
  let jid: FullJid = format!("jvbbrewery@internal.example.com/{}", name)
    .parse()
    .unwrap();
  let stats = BridgeStats::new()
    .with_stat("stress-level", 0.1)
    .with_stat("region", "eu-west")
    .with_stat("version", "2.3")
    .with_stat("relay-id", name);
  manager.bridge_registry().update(jid, &stats);
}

fn member_presence(nick: &str) -> Element {
  format!(
    "<presence xmlns='jabber:client' from='r1@conference.example.com/{}' \
     to='r1@conference.example.com/focus'>\
     <x xmlns='http://jabber.org/protocol/muc#user'>\
     <item affiliation='member' role='participant'/></x></presence>",
    nick
  )
  .parse()
  .unwrap()
}

async fn wait_for<F: Fn() -> bool>(predicate: F, what: &str) {
  for _ in 0..200 {
    if predicate() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  panic!("timed out waiting for {}", what);
}

fn is_jingle_action(element: &Element, action: &str) -> bool {
  element.name() == "iq"
    && element
      .children()
      .any(|child| child.name() == "jingle" && child.attr("action") == Some(action))
}

#[tokio::test]
async fn admission_and_invite_flow() {
  let sender = ScriptedSender::new();
  let manager = FocusManager::new(config(), sender.clone(), focus_jid(), FocusStats::new());
  register_bridge(&manager, "b1");

  // A trusted-domain user asks for a new room and gets a session id back.
  let handler = ConferenceIqHandler::new(manager.clone(), focus_jid());
  let mut request = ConferenceIq::new(room());
  request.machine_uid = Some("u1".to_owned());
  let from: Jid = Jid::Bare("user1@auth.example.com".parse().unwrap());
  let response = handler
    .handle_conference_request(&request, &from)
    .await
    .unwrap();
  assert_eq!(response.ready, Some(true));
  assert!(response.session_id.is_some());
  assert!(response.focus_jid.is_some());

  // An untrusted user cannot bring a new room into existence.
  let other_room: BareJid = "r2@conference.example.com".parse().unwrap();
  let mut request = ConferenceIq::new(other_room);
  request.machine_uid = Some("u2".to_owned());
  let from: Jid = Jid::Bare("user2@example.org".parse().unwrap());
  let error = handler
    .handle_conference_request(&request, &from)
    .await
    .unwrap_err();
  assert_eq!(
    error.defined_condition,
    xmpp_parsers::stanza_error::DefinedCondition::NotAuthorized
  );

  // A member joins the MUC: the focus allocates channels and sends the
  // offer.
  let conference = manager.get_conference(&room()).await.unwrap();
  conference
    .muc_room()
    .take(member_presence("abcd1234"))
    .await
    .unwrap();
  wait_for(
    || {
      sender
        .sent()
        .iter()
        .any(|element| is_jingle_action(element, "session-initiate"))
    },
    "session-initiate",
  )
  .await;
  assert_eq!(conference.participant_count().await, 1);
  let counts = conference.bridge_endpoint_counts().await;
  assert_eq!(counts.values().sum::<usize>(), 1);
}

#[tokio::test]
async fn redistributor_moves_endpoints_off_a_bridge() {
  let sender = ScriptedSender::new();
  let manager = FocusManager::new(config(), sender.clone(), focus_jid(), FocusStats::new());
  register_bridge(&manager, "b1");

  let conference = manager.conference_request(room()).await.unwrap();
  conference.muc_room().take(member_presence("aaaa0001")).await.unwrap();
  conference.muc_room().take(member_presence("aaaa0002")).await.unwrap();
  wait_for(
    || conference_endpoints(&sender) >= 2,
    "both invites to go out",
  )
  .await;

  let bridge_id = "jvbbrewery@internal.example.com/b1";
  let mut allocated = false;
  for _ in 0..200 {
    if conference.endpoints_on_bridge(bridge_id).await.len() == 2 {
      allocated = true;
      break;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  assert!(allocated, "both endpoints should be allocated on the bridge");

  let redistributor = LoadRedistributor::new(manager.clone());
  let result = redistributor
    .move_fraction(Some(bridge_id), Some(0.5))
    .await
    .unwrap();
  assert_eq!(result.moved_endpoints, 1);
  assert_eq!(result.conferences, 1);

  // Unknown bridges are rejected outright.
  let error = redistributor
    .move_fraction(Some("jvbbrewery@internal.example.com/nope"), Some(0.5))
    .await
    .unwrap_err();
  assert_eq!(error, lib_jitsi_focus::MoveError::BridgeNotFound);

  // And a malformed fraction never reaches the conferences.
  let error = redistributor
    .move_fraction(Some(bridge_id), Some(1.5))
    .await
    .unwrap_err();
  assert_eq!(
    error,
    lib_jitsi_focus::MoveError::InvalidParameter("fraction")
  );
}

fn conference_endpoints(sender: &ScriptedSender) -> usize {
  sender
    .sent()
    .iter()
    .filter(|element| is_jingle_action(element, "session-initiate"))
    .count()
}
