//! End-to-end SECS-I transfers over a loopback TCP tunnel.

use secs_core::{CommunicatorConfig, SecsCommunicator, SecsMessage};
use secs_i::{Secs1OnTcpIpCommunicator, Secs1OnTcpIpReceiverCommunicator};
use secs_ii::Item;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::time::Duration;

fn addr(port: u16) -> SocketAddr {
  format!("127.0.0.1:{}", port).parse().unwrap()
}

fn config(is_equip: bool) -> CommunicatorConfig {
  let mut config = CommunicatorConfig::new(10, is_equip);
  config.timeout_rebind = Duration::from_millis(300);
  config
}

/// 2 + 9 * (2 + 40) = 380 body bytes: spans exactly two blocks.
fn wide_body() -> Item {
  Item::List(
    (0..9)
      .map(|i| Item::U4((0..10).map(|j| i * 100 + j).collect()))
      .collect(),
  )
}

#[test]
fn two_block_message_reassembles_and_replies() {
  let equip = Secs1OnTcpIpReceiverCommunicator::new(addr(47101), config(true)).unwrap();
  let host = Secs1OnTcpIpCommunicator::new(addr(47101), config(false)).unwrap();

  let (primary_tx, primary_rx) = mpsc::channel();
  let replier = equip.clone();
  equip.add_primary_msg_listener(move |primary| {
    let _ = primary_tx.send(primary.clone());
    if primary.stream() == 6 && primary.function() == 3 {
      replier
        .reply(primary, 6, 4, false, Some(Item::bin(0)))
        .unwrap();
    }
  });

  equip.open().unwrap();
  host
    .open_and_wait_until_communicating(Some(Duration::from_secs(5)))
    .unwrap();
  equip
    .open_and_wait_until_communicating(Some(Duration::from_secs(5)))
    .unwrap();

  let reply = host
    .send(6, 3, true, Some(wide_body()))
    .unwrap()
    .unwrap();
  assert_eq!(reply.stream(), 6);
  assert_eq!(reply.function(), 4);
  assert_eq!(reply.body().unwrap().as_bin(), Some(&[0u8][..]));

  let primary = primary_rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(primary.stream(), 6);
  assert_eq!(primary.function(), 3);
  assert!(primary.w_bit());
  assert_eq!(primary.body(), Some(&wide_body()));

  host.close().unwrap();
  equip.close().unwrap();
}

#[test]
fn header_only_exchange_and_block_listeners() {
  let equip = Secs1OnTcpIpReceiverCommunicator::new(addr(47102), config(true)).unwrap();
  let host = Secs1OnTcpIpCommunicator::new(addr(47102), config(false)).unwrap();

  let replier = equip.clone();
  equip.add_primary_msg_listener(move |primary| {
    replier.reply(primary, 1, 2, false, None).unwrap();
  });

  let (sent_tx, sent_rx) = mpsc::channel();
  host.add_sent_block_listener(move |block| {
    let _ = sent_tx.send(block.clone());
  });

  equip.open().unwrap();
  host
    .open_and_wait_until_communicating(Some(Duration::from_secs(5)))
    .unwrap();

  let reply = host.send(1, 1, true, None).unwrap().unwrap();
  assert_eq!(reply.function(), 2);
  assert!(!reply.w_bit());
  assert!(reply.body().is_none());
  // Replies from the equipment carry the R-Bit.
  assert!(reply.r_bit());

  let block = sent_rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(block.length_byte(), 10);
  assert!(block.e_bit());

  host.close().unwrap();
  equip.close().unwrap();
}

#[test]
fn send_without_wbit_returns_immediately() {
  let equip = Secs1OnTcpIpReceiverCommunicator::new(addr(47103), config(true)).unwrap();
  let host = Secs1OnTcpIpCommunicator::new(addr(47103), config(false)).unwrap();

  let (primary_tx, primary_rx) = mpsc::channel();
  equip.add_primary_msg_listener(move |primary| {
    let _ = primary_tx.send(primary.clone());
  });

  equip.open().unwrap();
  host
    .open_and_wait_until_communicating(Some(Duration::from_secs(5)))
    .unwrap();

  assert!(host.send(5, 1, false, Some(Item::u2(1001))).unwrap().is_none());
  let primary = primary_rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(primary.stream(), 5);
  assert!(!primary.w_bit());

  host.close().unwrap();
  equip.close().unwrap();
}

#[test]
fn close_is_idempotent_and_unblocks() {
  let host = Secs1OnTcpIpCommunicator::new(addr(47104), config(false)).unwrap();
  host.open().unwrap();
  host.open().unwrap();
  host.close().unwrap();
  host.close().unwrap();
  assert!(matches!(
    host.open(),
    Err(secs_i::Secs1Error::AlreadyClosed)
  ));
  assert!(matches!(
    host.send(1, 1, true, None),
    Err(secs_i::Secs1Error::AlreadyClosed)
  ));
}
