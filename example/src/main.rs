//! A host and an equipment talking HSMS-SS over loopback: establish
//! communications, poll the clock, exchange an SML-built message, then
//! separate.

use gem::{Clock, CommAck, Gem, TimeAck};
use hsms_ss::{HsmsSsActiveCommunicator, HsmsSsPassiveCommunicator};
use secs_core::{CommunicatorConfig, SecsCommunicator, SecsMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let address: SocketAddr = "127.0.0.1:5000".parse().unwrap();

  // EQUIPMENT
  let mut equip_config = CommunicatorConfig::new(10, true);
  equip_config.name = Some("equip".to_string());
  equip_config.gem_mdln = "MDLN-A".to_string();
  equip_config.gem_softrev = "000001".to_string();
  let equip = HsmsSsPassiveCommunicator::new(address, equip_config).unwrap();
  let equip_gem = Arc::new(Gem::new(equip.clone(), equip.config()));

  let responder = equip.clone();
  let responder_gem = equip_gem.clone();
  equip.add_primary_msg_listener(move |primary| {
    tracing::info!("equip received\n{}", primary);
    let result = match (primary.stream(), primary.function()) {
      (1, 1) => responder
        .reply_sml(primary, "S1F2 <L <A \"MDLN-A\"> <A \"000001\">>.")
        .map_err(|e| e.to_string()),
      (1, 13) => responder_gem
        .s1f14(primary, CommAck::Accepted)
        .map_err(|e| e.to_string()),
      (2, 17) => responder_gem
        .s2f18_now(primary)
        .map_err(|e| e.to_string()),
      (2, 31) => responder_gem
        .s2f32(primary, TimeAck::Accepted)
        .map_err(|e| e.to_string()),
      _ if primary.w_bit() => responder
        .reply(primary, 0, 0, false, None)
        .map_err(|e| e.to_string()),
      _ => Ok(()),
    };
    if let Err(error) = result {
      tracing::error!(%error, "equip reply failed");
    }
  });
  equip.add_error_listener(|error| tracing::warn!(%error, "equip error"));
  equip.open().unwrap();

  // HOST
  let mut host_config = CommunicatorConfig::new(10, false);
  host_config.name = Some("host".to_string());
  let host = HsmsSsActiveCommunicator::new(address, host_config).unwrap();
  host.add_communicate_listener(|communicating| {
    tracing::info!(communicating, "host communicate state");
  });
  host.add_error_listener(|error| tracing::warn!(%error, "host error"));
  host
    .open_and_wait_until_communicating(Some(Duration::from_secs(10)))
    .unwrap();

  let host_gem = Gem::new(host.clone(), host.config());
  let commack = host_gem.s1f13().unwrap();
  tracing::info!(?commack, "S1F13 acknowledged");

  let reply = host.send_sml("S1F1 W.").unwrap().unwrap();
  tracing::info!("host received\n{}", reply);

  let clock = host_gem.s2f17().unwrap();
  tracing::info!(time = %clock.datetime(), "equipment clock");

  let tiack = host_gem.s2f31(Clock::now()).unwrap();
  tracing::info!(?tiack, "S2F31 acknowledged");

  host.separate().unwrap();
  host.close().unwrap();
  equip.close().unwrap();
}
