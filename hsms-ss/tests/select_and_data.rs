//! End-to-end select and data exchange over loopback TCP.

use hsms_ss::{
  HsmsCommunicateState, HsmsMessage, HsmsSsActiveCommunicator, HsmsSsPassiveCommunicator,
};
use secs_core::{CommunicatorConfig, SecsCommunicator, SecsMessage};
use secs_ii::Item;
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
  config
}

fn open_pair(
  port: u16,
) -> (
  Arc<HsmsSsPassiveCommunicator>,
  Arc<HsmsSsActiveCommunicator>,
) {
  let passive = HsmsSsPassiveCommunicator::new(addr(port), config(true)).unwrap();
  let active = HsmsSsActiveCommunicator::new(addr(port), config(false)).unwrap();
  (passive, active)
}

#[test]
fn select_happy_path_and_s1f1_exchange() {
  let (passive, active) = open_pair(46101);

  let equip = passive.clone();
  passive.add_primary_msg_listener(move |primary| {
    if primary.stream() == 1 && primary.function() == 1 {
      equip
        .reply_sml(primary, "S1F2 <L <A \"MDLN-A\"> <A \"000001\">>.")
        .unwrap();
    }
  });

  passive.open().unwrap();
  active
    .open_and_wait_until_communicating(Some(Duration::from_secs(5)))
    .unwrap();
  passive
    .open_and_wait_until_communicating(Some(Duration::from_secs(5)))
    .unwrap();
  assert_eq!(active.communicate_state(), HsmsCommunicateState::Selected);
  assert_eq!(passive.communicate_state(), HsmsCommunicateState::Selected);

  let reply = active.send(1, 1, true, None).unwrap().unwrap();
  assert_eq!(reply.stream(), 1);
  assert_eq!(reply.function(), 2);
  assert!(!reply.w_bit());
  let body = reply.body().unwrap();
  assert_eq!(body.as_list().unwrap().len(), 2);
  assert_eq!(body.get(&[0]).unwrap().as_ascii(), Some("MDLN-A"));
  assert_eq!(body.get(&[1]).unwrap().as_ascii(), Some("000001"));

  active.close().unwrap();
  passive.close().unwrap();
}

#[test]
fn unknown_stream_gets_s0f0_and_s9f3() {
  let (passive, active) = open_pair(46102);

  let equip = passive.clone();
  passive.add_primary_msg_listener(move |primary| {
    if primary.stream() == 99 {
      equip.reply(primary, 0, 0, false, None).unwrap();
      equip
        .send(9, 3, false, Some(Item::Bin(primary.header10().to_vec())))
        .unwrap();
    }
  });

  let (s9_tx, s9_rx) = std::sync::mpsc::channel::<HsmsMessage>();
  active.add_primary_msg_listener(move |primary| {
    let _ = s9_tx.send(primary.clone());
  });

  passive.open().unwrap();
  active
    .open_and_wait_until_communicating(Some(Duration::from_secs(5)))
    .unwrap();

  let reply = active.send(99, 99, true, None).unwrap().unwrap();
  assert_eq!(reply.stream(), 0);
  assert_eq!(reply.function(), 0);
  assert!(!reply.w_bit());
  assert!(reply.body().is_none());

  let s9f3 = s9_rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(s9f3.stream(), 9);
  assert_eq!(s9f3.function(), 3);
  assert_eq!(s9f3.body().unwrap().as_bin().unwrap().len(), 10);

  active.close().unwrap();
  passive.close().unwrap();
}

#[test]
fn linktest_round_trips_both_ways() {
  let (passive, active) = open_pair(46103);
  passive.open().unwrap();
  active
    .open_and_wait_until_communicating(Some(Duration::from_secs(5)))
    .unwrap();
  passive
    .open_and_wait_until_communicating(Some(Duration::from_secs(5)))
    .unwrap();

  active.linktest().unwrap();
  passive.linktest().unwrap();

  active.close().unwrap();
  passive.close().unwrap();
}

#[test]
fn close_is_idempotent_and_open_after_close_fails() {
  let (passive, active) = open_pair(46104);
  passive.open().unwrap();
  passive.open().unwrap();
  active.open().unwrap();

  active.close().unwrap();
  active.close().unwrap();
  passive.close().unwrap();
  passive.close().unwrap();

  assert!(matches!(
    active.open(),
    Err(hsms_ss::HsmsError::AlreadyClosed)
  ));
}
