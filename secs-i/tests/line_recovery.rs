//! Line-level recovery behavior, driven by a raw TCP peer speaking the
//! ENQ/EOT/ACK/NAK handshake byte by byte.

use secs_core::{CommunicatorConfig, SecsCommunicator, SecsMessage};
use secs_i::{
  Secs1Error, Secs1Message, Secs1OnTcpIpCommunicator, Secs1OnTcpIpReceiverCommunicator,
};
use secs_ii::Item;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const ENQ: u8 = 0x05;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;

fn addr(port: u16) -> SocketAddr {
  format!("127.0.0.1:{}", port).parse().unwrap()
}

fn read_byte(socket: &mut TcpStream) -> u8 {
  let mut byte = [0u8; 1];
  socket.read_exact(&mut byte).unwrap();
  byte[0]
}

/// Plays one sender-side block handshake: ENQ, wait EOT, frame bytes out,
/// return the response byte.
fn play_block(socket: &mut TcpStream, frame: &[u8]) -> u8 {
  socket.write_all(&[ENQ]).unwrap();
  assert_eq!(read_byte(socket), EOT);
  socket.write_all(frame).unwrap();
  read_byte(socket)
}

/// Reads one framed block sent by the communicator and acknowledges it.
fn accept_block(socket: &mut TcpStream) -> Vec<u8> {
  assert_eq!(read_byte(socket), ENQ);
  socket.write_all(&[EOT]).unwrap();
  let length = read_byte(socket) as usize;
  let mut rest = vec![0u8; length + 2];
  socket.read_exact(&mut rest).unwrap();
  socket.write_all(&[ACK]).unwrap();
  let mut frame = vec![length as u8];
  frame.extend_from_slice(&rest);
  frame
}

#[test]
fn sum_check_failure_is_nakked_and_retransmission_succeeds() {
  let mut config = CommunicatorConfig::new(10, true);
  config.timeout_t1 = Duration::from_millis(100);
  config.timeout_rebind = Duration::from_millis(300);
  let equip = Secs1OnTcpIpReceiverCommunicator::new(addr(47111), config).unwrap();

  let (primary_tx, primary_rx) = mpsc::channel();
  equip.add_primary_msg_listener(move |primary| {
    let _ = primary_tx.send(primary.clone());
  });
  equip.open().unwrap();
  thread::sleep(Duration::from_millis(300));

  // The raw peer is the host sending a two-block message with one bit
  // flipped in the first block.
  let body = Item::Bin((0..=255u16).cycle().take(400).map(|v| v as u8).collect());
  let message =
    Secs1Message::new(6, 3, false, Some(body), [0, 0, 0, 21], 10, false).unwrap();
  let blocks = message.to_blocks();
  assert_eq!(blocks.len(), 2);

  let mut socket = TcpStream::connect(addr(47111)).unwrap();
  socket
    .set_read_timeout(Some(Duration::from_secs(5)))
    .unwrap();

  let mut corrupted = blocks[0].to_bytes().to_vec();
  corrupted[12] ^= 0x01;
  assert_eq!(play_block(&mut socket, &corrupted), NAK);

  // Retransmit the same block intact, then finish the message.
  assert_eq!(play_block(&mut socket, blocks[0].to_bytes()), ACK);
  assert_eq!(play_block(&mut socket, blocks[1].to_bytes()), ACK);

  let primary = primary_rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(primary, message);

  equip.close().unwrap();
}

#[test]
fn duplicate_block_is_dropped_without_breaking_reassembly() {
  let mut config = CommunicatorConfig::new(10, true);
  config.timeout_t1 = Duration::from_millis(100);
  config.timeout_rebind = Duration::from_millis(300);
  let equip = Secs1OnTcpIpReceiverCommunicator::new(addr(47112), config).unwrap();

  let (primary_tx, primary_rx) = mpsc::channel();
  equip.add_primary_msg_listener(move |primary| {
    let _ = primary_tx.send(primary.clone());
  });
  equip.open().unwrap();
  thread::sleep(Duration::from_millis(300));

  let body = Item::Bin(vec![0x5A; 400]);
  let message =
    Secs1Message::new(6, 5, false, Some(body), [0, 0, 0, 22], 10, false).unwrap();
  let blocks = message.to_blocks();
  assert_eq!(blocks.len(), 2);

  let mut socket = TcpStream::connect(addr(47112)).unwrap();
  socket
    .set_read_timeout(Some(Duration::from_secs(5)))
    .unwrap();

  // Block 1, then block 1 again (as if our ACK was lost), then block 2.
  assert_eq!(play_block(&mut socket, blocks[0].to_bytes()), ACK);
  assert_eq!(play_block(&mut socket, blocks[0].to_bytes()), ACK);
  assert_eq!(play_block(&mut socket, blocks[1].to_bytes()), ACK);

  let primary = primary_rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(primary, message);

  equip.close().unwrap();
}

#[test]
fn out_of_sequence_block_restarts_reassembly() {
  let mut config = CommunicatorConfig::new(10, true);
  config.timeout_t1 = Duration::from_millis(100);
  config.timeout_rebind = Duration::from_millis(300);
  let equip = Secs1OnTcpIpReceiverCommunicator::new(addr(47115), config).unwrap();

  let (primary_tx, primary_rx) = mpsc::channel();
  equip.add_primary_msg_listener(move |primary| {
    let _ = primary_tx.send(primary.clone());
  });
  equip.open().unwrap();
  thread::sleep(Duration::from_millis(300));

  let abandoned =
    Secs1Message::new(6, 7, false, Some(Item::Bin(vec![0x11; 300])), [0, 0, 0, 31], 10, false)
      .unwrap();
  let delivered =
    Secs1Message::new(6, 9, false, Some(Item::Bin(vec![0x22; 300])), [0, 0, 0, 32], 10, false)
      .unwrap();

  let mut socket = TcpStream::connect(addr(47115)).unwrap();
  socket
    .set_read_timeout(Some(Duration::from_secs(5)))
    .unwrap();

  // The first message is abandoned after its first block; its partial
  // state must not survive the out-of-sequence block that follows.
  assert_eq!(play_block(&mut socket, abandoned.to_blocks()[0].to_bytes()), ACK);
  assert_eq!(play_block(&mut socket, delivered.to_blocks()[0].to_bytes()), ACK);
  assert_eq!(play_block(&mut socket, delivered.to_blocks()[1].to_bytes()), ACK);

  let primary = primary_rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(primary, delivered);
  assert!(primary_rx.recv_timeout(Duration::from_millis(300)).is_err());

  equip.close().unwrap();
}

#[test]
fn t3_window_is_extended_by_each_reply_block() {
  let mut config = CommunicatorConfig::new(10, false);
  config.timeout_t3 = Duration::from_secs(1);
  config.timeout_rebind = Duration::from_millis(300);
  let host = Secs1OnTcpIpCommunicator::new(addr(47113), config).unwrap();

  let listener = TcpListener::bind(addr(47113)).unwrap();
  let peer = thread::spawn(move || {
    let (mut socket, _) = listener.accept().unwrap();
    socket
      .set_read_timeout(Some(Duration::from_secs(10)))
      .unwrap();

    // Take the host's primary and pull its system bytes.
    let frame = accept_block(&mut socket);
    let system = [frame[7], frame[8], frame[9], frame[10]];

    // A three-block reply whose delivery spans well past T3, with every
    // inter-block gap inside it.
    let reply = Secs1Message::new(
      1,
      2,
      false,
      Some(Item::Bin(vec![7; 600])),
      system,
      10,
      true,
    )
    .unwrap();
    let blocks = reply.to_blocks();
    assert_eq!(blocks.len(), 3);
    for block in blocks {
      thread::sleep(Duration::from_millis(500));
      assert_eq!(play_block(&mut socket, block.to_bytes()), ACK);
    }
  });

  host
    .open_and_wait_until_communicating(Some(Duration::from_secs(5)))
    .unwrap();

  let started = Instant::now();
  let reply = host.send(1, 1, true, None).unwrap().unwrap();
  let elapsed = started.elapsed();

  assert_eq!(reply.function(), 2);
  assert_eq!(reply.body().unwrap().as_bin().unwrap().len(), 600);
  // The reply took longer than T3 in total, yet the send survived because
  // every arriving block re-armed the window.
  assert!(elapsed > Duration::from_secs(1), "elapsed {:?}", elapsed);

  peer.join().unwrap();
  host.close().unwrap();
}

#[test]
fn silence_after_enq_exhausts_retries() {
  let mut config = CommunicatorConfig::new(10, false);
  config.timeout_t2 = Duration::from_millis(200);
  config.retry = 1;
  config.timeout_rebind = Duration::from_millis(300);
  let host = Secs1OnTcpIpCommunicator::new(addr(47114), config).unwrap();

  // A peer that accepts the connection and never answers.
  let listener = TcpListener::bind(addr(47114)).unwrap();
  let peer = thread::spawn(move || {
    let (socket, _) = listener.accept().unwrap();
    thread::sleep(Duration::from_secs(3));
    drop(socket);
  });

  host
    .open_and_wait_until_communicating(Some(Duration::from_secs(5)))
    .unwrap();

  let error = host.send(1, 1, true, None).unwrap_err();
  assert!(matches!(error, Secs1Error::RetryOver));

  host.close().unwrap();
  peer.join().unwrap();
}
