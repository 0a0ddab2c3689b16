//! GEM transactions exercised over a loopback HSMS-SS session.

use gem::{Clock, CommAck, Gem, OnLineAck, TimeAck};
use hsms_ss::{HsmsSsActiveCommunicator, HsmsSsPassiveCommunicator};
use secs_core::{ClockType, CommunicatorConfig, SecsCommunicator, SecsMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

fn addr(port: u16) -> SocketAddr {
  format!("127.0.0.1:{}", port).parse().unwrap()
}

fn config(is_equip: bool) -> CommunicatorConfig {
  let mut config = CommunicatorConfig::new(10, is_equip);
  config.timeout_t5 = Duration::from_millis(300);
  config.timeout_rebind = Duration::from_millis(300);
  config.gem_mdln = "MDLN-A".to_string();
  config.gem_softrev = "000001".to_string();
  config.gem_clock_type = ClockType::A16;
  config
}

#[test]
fn establish_online_and_clock_transactions() {
  let equip =
    HsmsSsPassiveCommunicator::new(addr(48101), config(true)).unwrap();
  let host = HsmsSsActiveCommunicator::new(addr(48101), config(false)).unwrap();

  let equip_gem = Arc::new(Gem::new(equip.clone(), equip.config()));
  let responder = equip_gem.clone();
  equip.add_primary_msg_listener(move |primary| {
    match (primary.stream(), primary.function()) {
      (1, 13) => responder.s1f14(primary, CommAck::Accepted).unwrap(),
      (1, 17) => responder.s1f18(primary, OnLineAck::Accepted).unwrap(),
      (2, 17) => responder.s2f18_now(primary).unwrap(),
      (2, 31) => responder.s2f32(primary, TimeAck::Accepted).unwrap(),
      _ => {}
    }
  });

  equip.open().unwrap();
  host
    .open_and_wait_until_communicating(Some(Duration::from_secs(5)))
    .unwrap();

  let host_gem = Gem::new(host.clone(), host.config());
  assert_eq!(host_gem.s1f13().unwrap(), CommAck::Accepted);
  assert_eq!(host_gem.s1f17().unwrap(), OnLineAck::Accepted);

  let clock = host_gem.s2f17().unwrap();
  let now = Clock::now().datetime();
  let skew = (now - clock.datetime()).num_seconds().abs();
  assert!(skew < 60, "clock skew {} seconds", skew);

  assert_eq!(host_gem.s2f31_now().unwrap(), TimeAck::Accepted);

  host.close().unwrap();
  equip.close().unwrap();
}
