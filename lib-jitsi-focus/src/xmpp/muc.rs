use std::{collections::HashMap, fmt, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use xmpp_parsers::{
  muc::{
    user::{Affiliation, Role, Status as MucStatus},
    Muc, MucUser,
  },
  ns,
  presence::{self, Presence},
  BareJid, Element, FullJid, Jid,
};

use crate::xmpp::{connection::StanzaFilter, router::IqSender};

/// One occupant of a MUC, as the focus sees it through presence.
#[derive(Debug, Clone)]
pub struct MucOccupant {
  /// The occupant's jid in the room (`room@muc.domain/nick`).
  pub occupant_jid: FullJid,

  /// The occupant's real jid, when the room exposes it.
  pub real_jid: Option<FullJid>,

  pub role: Role,
  pub affiliation: Affiliation,

  /// The raw presence extensions, for status payloads like bridge stats.
  pub payloads: Vec<Element>,
}

impl MucOccupant {
  pub fn nick(&self) -> &str {
    &self.occupant_jid.resource
  }

  pub fn is_moderator(&self) -> bool {
    self.role == Role::Moderator
      || matches!(self.affiliation, Affiliation::Owner | Affiliation::Admin)
  }

  pub fn payload(&self, name: &str, namespace: &str) -> Option<&Element> {
    self.payloads.iter().find(|payload| payload.is(name, namespace))
  }
}

/// Callbacks a component registers to observe a room.
#[async_trait]
pub trait MucRoomHandler: Send + Sync {
  async fn occupant_joined(&self, occupant: MucOccupant) -> Result<()>;
  async fn occupant_presence_changed(&self, occupant: MucOccupant) -> Result<()>;
  async fn occupant_left(&self, occupant: MucOccupant) -> Result<()>;

  async fn self_joined(&self) -> Result<()> {
    Ok(())
  }
}

struct MucRoomInner {
  joined: bool,
  occupants: HashMap<String, MucOccupant>,
  extensions: Vec<Element>,
  handler: Option<Arc<dyn MucRoomHandler>>,
}

/// A MUC the focus occupies: a conference room or a worker brewery.
#[derive(Clone)]
pub struct MucRoom {
  sender: Arc<dyn IqSender>,
  jid: BareJid,
  nick: String,
  inner: Arc<Mutex<MucRoomInner>>,
}

impl fmt::Debug for MucRoom {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MucRoom")
      .field("jid", &self.jid)
      .field("nick", &self.nick)
      .finish()
  }
}

impl MucRoom {
  pub fn new(sender: Arc<dyn IqSender>, jid: BareJid, nick: impl Into<String>) -> MucRoom {
    MucRoom {
      sender,
      jid,
      nick: nick.into(),
      inner: Arc::new(Mutex::new(MucRoomInner {
        joined: false,
        occupants: HashMap::new(),
        extensions: vec![],
        handler: None,
      })),
    }
  }

  pub fn jid(&self) -> &BareJid {
    &self.jid
  }

  pub fn own_occupant_jid(&self) -> FullJid {
    self.jid.clone().with_resource(&self.nick)
  }

  pub async fn set_handler(&self, handler: Arc<dyn MucRoomHandler>) {
    self.inner.lock().await.handler = Some(handler);
  }

  #[tracing::instrument(level = "debug", err)]
  pub async fn join(&self, extensions: Vec<Element>) -> Result<()> {
    let mut locked_inner = self.inner.lock().await;
    locked_inner.extensions = extensions;
    let mut payloads: Vec<Element> = vec![Muc::new().into()];
    payloads.extend(locked_inner.extensions.iter().cloned());
    drop(locked_inner);
    self.send_presence(payloads).await
  }

  #[tracing::instrument(level = "debug", err)]
  pub async fn leave(&self) -> Result<()> {
    let presence =
      Presence::new(presence::Type::Unavailable).with_to(Jid::Full(self.own_occupant_jid()));
    self.sender.send_stanza(presence.into()).await
  }

  /// Replaces this room's own presence extensions and republishes them.
  pub async fn set_presence_extensions(&self, extensions: Vec<Element>) -> Result<()> {
    let payloads = {
      let mut locked_inner = self.inner.lock().await;
      locked_inner.extensions = extensions;
      let mut payloads: Vec<Element> = vec![Muc::new().into()];
      payloads.extend(locked_inner.extensions.iter().cloned());
      payloads
    };
    self.send_presence(payloads).await
  }

  /// Replaces one extension, keyed by element name and namespace, and
  /// republishes our presence.
  pub async fn update_presence_extension(&self, extension: Element) -> Result<()> {
    let payloads = {
      let mut locked_inner = self.inner.lock().await;
      locked_inner
        .extensions
        .retain(|el| !(el.name() == extension.name() && el.ns() == extension.ns()));
      locked_inner.extensions.push(extension);
      let mut payloads: Vec<Element> = vec![Muc::new().into()];
      payloads.extend(locked_inner.extensions.iter().cloned());
      payloads
    };
    self.send_presence(payloads).await
  }

  async fn send_presence(&self, payloads: Vec<Element>) -> Result<()> {
    let mut presence =
      Presence::new(presence::Type::None).with_to(Jid::Full(self.own_occupant_jid()));
    presence.payloads = payloads;
    self.sender.send_stanza(presence.into()).await
  }

  pub async fn occupant(&self, nick: &str) -> Option<MucOccupant> {
    self.inner.lock().await.occupants.get(nick).cloned()
  }

  pub async fn occupants(&self) -> Vec<MucOccupant> {
    self.inner.lock().await.occupants.values().cloned().collect()
  }

  pub async fn occupant_count(&self) -> usize {
    self.inner.lock().await.occupants.len()
  }
}

#[async_trait]
impl StanzaFilter for MucRoom {
  fn name(&self) -> &'static str {
    "muc-room"
  }

  fn filter(&self, element: &Element) -> bool {
    element.is("presence", ns::DEFAULT_NS)
      && element
        .attr("from")
        .and_then(|from| from.parse::<FullJid>().ok())
        .map(|from| BareJid::from(from) == self.jid)
        .unwrap_or_default()
  }

  async fn take(&self, element: Element) -> Result<()> {
    let presence = Presence::try_from(element)?;
    let from = match presence.from.clone().context("missing from in presence")? {
      Jid::Full(from) => from,
      Jid::Bare(_) => return Ok(()),
    };
    trace!("received MUC presence from {}", from);

    let muc_user = match presence
      .payloads
      .iter()
      .find(|payload| payload.is("x", ns::MUC_USER))
    {
      Some(payload) => MucUser::try_from(payload.clone())?,
      None => return Ok(()),
    };

    if from.resource == self.nick || muc_user.status.contains(&MucStatus::SelfPresence) {
      if presence.type_ != presence::Type::Unavailable {
        let handler = {
          let mut locked_inner = self.inner.lock().await;
          let newly_joined = !locked_inner.joined;
          locked_inner.joined = true;
          if newly_joined {
            debug!("joined MUC: {}", self.jid);
            locked_inner.handler.clone()
          }
          else {
            None
          }
        };
        if let Some(handler) = handler {
          handler.self_joined().await?;
        }
      }
      return Ok(());
    }

    let item = match muc_user.items.first() {
      Some(item) => item,
      None => return Ok(()),
    };
    let occupant = MucOccupant {
      occupant_jid: from.clone(),
      real_jid: item.jid.clone(),
      role: item.role.clone(),
      affiliation: item.affiliation.clone(),
      payloads: presence
        .payloads
        .iter()
        .filter(|payload| !payload.is("x", ns::MUC_USER))
        .cloned()
        .collect(),
    };

    let (handler, event) = {
      let mut locked_inner = self.inner.lock().await;
      let handler = locked_inner.handler.clone();
      if presence.type_ == presence::Type::Unavailable {
        match locked_inner.occupants.remove(&from.resource) {
          Some(_) => (handler, OccupantEvent::Left),
          None => return Ok(()),
        }
      }
      else {
        let previous = locked_inner
          .occupants
          .insert(from.resource.clone(), occupant.clone());
        match previous {
          Some(_) => (handler, OccupantEvent::Changed),
          None => (handler, OccupantEvent::Joined),
        }
      }
    };

    if let Some(handler) = handler {
      let result = match event {
        OccupantEvent::Joined => handler.occupant_joined(occupant).await,
        OccupantEvent::Changed => handler.occupant_presence_changed(occupant).await,
        OccupantEvent::Left => handler.occupant_left(occupant).await,
      };
      if let Err(e) = result {
        warn!("MUC occupant handler failed: {:?}", e);
      }
    }
    Ok(())
  }
}

enum OccupantEvent {
  Joined,
  Changed,
  Left,
}
