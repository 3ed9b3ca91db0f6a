use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use lib_jitsi_focus::{
  init_tracing,
  xmpp::muc::MucRoom,
  Authentication, ConferenceIqHandler, Connection, FocusConfig, FocusManager, FocusStats,
  IqRouter, JibriIqHandler, JingleIqHandler,
};
use structopt::StructOpt;
use tokio::{signal::ctrl_c, time};
use tracing::{info, warn};

#[derive(Debug, Clone, StructOpt)]
#[structopt(
  name = "jitsi-focus",
  about = "Conference focus for Jitsi Meet deployments."
)]
struct Opt {
  #[structopt(long)]
  web_socket_url: String,

  #[structopt(
    long,
    help = "If not specified, assumed to be the host part of <web-socket-url>"
  )]
  xmpp_domain: Option<String>,

  #[structopt(long)]
  xmpp_username: Option<String>,

  #[structopt(long)]
  xmpp_password: Option<String>,

  #[structopt(
    long,
    help = "The MUC where bridges advertise themselves, e.g. jvbbrewery@internal.auth.example.com"
  )]
  bridge_brewery: String,

  #[structopt(
    long,
    help = "The MUC where Jibri instances advertise themselves"
  )]
  jibri_brewery: Option<String>,

  #[structopt(
    long,
    default_value = "region-based",
    help = "Bridge selection strategy. One of: single-bridge, split-bridge, region-based, region-based-with-cascade"
  )]
  selection_strategy: String,

  #[structopt(long, help = "The region this focus runs in")]
  region: Option<String>,

  #[structopt(
    long,
    help = "XMPP domain whose users are trusted to create rooms, e.g. auth.example.com"
  )]
  trusted_domain: Option<String>,

  #[structopt(long, default_value = "20")]
  max_ssrcs_per_endpoint: usize,

  #[structopt(long, default_value = "15", help = "IQ timeout in seconds")]
  iq_timeout: u64,

  #[structopt(long, default_value = "90", help = "Jibri pending timeout in seconds")]
  jibri_pending_timeout: u64,

  #[structopt(long, default_value = "2")]
  jibri_num_retries: u32,

  #[structopt(long)]
  tls_insecure: bool,

  #[structopt(short, long, parse(from_occurrences))]
  verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
  let opt = Opt::from_args();

  init_tracing(match opt.verbose {
    0 => tracing::Level::INFO,
    1 => tracing::Level::DEBUG,
    _ => tracing::Level::TRACE,
  });

  let web_socket_url: http::Uri = opt
    .web_socket_url
    .parse()
    .context("invalid WebSocket URL")?;
  let xmpp_domain = opt
    .xmpp_domain
    .as_deref()
    .or_else(|| web_socket_url.host())
    .context("invalid WebSocket URL, specify --xmpp-domain")?
    .to_owned();

  let config = FocusConfig {
    region: opt.region.clone(),
    max_ssrcs_per_endpoint: opt.max_ssrcs_per_endpoint,
    selection_strategy: opt.selection_strategy.parse()?,
    iq_timeout: Duration::from_secs(opt.iq_timeout),
    jibri_pending_timeout: Duration::from_secs(opt.jibri_pending_timeout),
    jibri_num_retries: opt.jibri_num_retries,
    trusted_domain: opt.trusted_domain.clone(),
    ..Default::default()
  };

  let authentication = match (opt.xmpp_username.clone(), opt.xmpp_password.clone()) {
    (Some(username), Some(password)) => Authentication::Plain { username, password },
    _ => Authentication::Anonymous,
  };

  let stats = FocusStats::new();

  let (connection, background) = Connection::new(
    &opt.web_socket_url,
    &xmpp_domain,
    authentication,
    opt.tls_insecure,
    stats.clone(),
  )
  .await?;
  tokio::spawn(background);
  connection.connect().await?;
  let focus_jid = connection.jid().await.context("no JID after connect")?;
  info!("Connected as {}", focus_jid);

  let router = IqRouter::new(connection.sender(), config.iq_timeout);
  connection.add_stanza_filter(router.clone()).await;
  let sender: Arc<dyn lib_jitsi_focus::IqSender> = Arc::new(router);

  let manager = FocusManager::new(config, sender.clone(), focus_jid.clone(), stats);

  let bridge_brewery = MucRoom::new(sender.clone(), opt.bridge_brewery.parse()?, "focus");
  bridge_brewery
    .set_handler(Arc::new(manager.bridge_registry().clone()))
    .await;
  connection.add_stanza_filter(bridge_brewery.clone()).await;
  bridge_brewery.join(vec![]).await?;

  if let Some(jibri_brewery) = &opt.jibri_brewery {
    let jibri_brewery = MucRoom::new(sender.clone(), jibri_brewery.parse()?, "focus");
    jibri_brewery
      .set_handler(Arc::new(manager.jibri_detector().clone()))
      .await;
    connection.add_stanza_filter(jibri_brewery.clone()).await;
    jibri_brewery.join(vec![]).await?;
  }

  connection
    .add_stanza_filter(ConferenceIqHandler::new(manager.clone(), focus_jid.clone()))
    .await;
  connection
    .add_stanza_filter(JingleIqHandler::new(
      focus_jid.clone(),
      manager.jingle_registry().clone(),
      sender.clone(),
    ))
    .await;
  connection
    .add_stanza_filter(JibriIqHandler::new(
      manager.clone(),
      sender.clone(),
      focus_jid.clone(),
    ))
    .await;

  {
    let manager = manager.clone();
    tokio::spawn(async move {
      let mut interval = time::interval(Duration::from_secs(30));
      loop {
        interval.tick().await;
        manager.reap_conferences().await;
      }
    });
  }

  info!("Focus up, waiting for conference requests");
  ctrl_c().await?;
  if let Err(e) = async {
    for conference in manager.conferences().await {
      conference
        .end_conference(lib_jitsi_focus::Reason::Gone, "focus shutting down")
        .await;
    }
    Ok::<_, anyhow::Error>(())
  }
  .await
  {
    warn!("shutdown cleanup failed: {:?}", e);
  }
  Ok(())
}
