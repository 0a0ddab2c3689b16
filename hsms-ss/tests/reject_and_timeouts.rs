//! Reject semantics and timeout behavior over loopback TCP, partly with a
//! raw socket standing in for a misbehaving remote entity.

use hsms_ss::{
  ControlType, HsmsError, HsmsMessage, HsmsSsActiveCommunicator, HsmsSsPassiveCommunicator,
  RejectReason, SelectStatus,
};
use secs_core::{CommunicatorConfig, SecsCommunicator, SecsMessage};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
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

/// Writes one frame and reads back exactly one 14-byte control frame.
fn exchange_frame(socket: &mut TcpStream, frame: &[u8]) -> HsmsMessage {
  socket.write_all(frame).unwrap();
  let mut response = [0u8; 14];
  socket.read_exact(&mut response).unwrap();
  HsmsMessage::from_bytes(&response).unwrap()
}

#[test]
fn data_before_select_is_rejected_not_selected() {
  let passive = HsmsSsPassiveCommunicator::new(addr(46111), config(true)).unwrap();
  passive.open().unwrap();
  std::thread::sleep(Duration::from_millis(300));

  let mut socket = TcpStream::connect(addr(46111)).unwrap();
  socket
    .set_read_timeout(Some(Duration::from_secs(5)))
    .unwrap();

  let data = HsmsMessage::data(10, 1, 1, true, None, [0, 0, 0, 7]).unwrap();
  let response = exchange_frame(&mut socket, data.to_bytes());
  assert_eq!(response.control_type(), ControlType::RejectReq);
  assert_eq!(response.reject_reason(), Some(RejectReason::NotSelected));
  assert_eq!(response.header10()[6..10], [0, 0, 0, 7]);

  passive.close().unwrap();
}

#[test]
fn second_select_gets_already_used() {
  let passive = HsmsSsPassiveCommunicator::new(addr(46112), config(true)).unwrap();
  let active = HsmsSsActiveCommunicator::new(addr(46112), config(false)).unwrap();
  passive.open().unwrap();
  active
    .open_and_wait_until_communicating(Some(Duration::from_secs(5)))
    .unwrap();

  // A second client races for the selected slot.
  let mut socket = TcpStream::connect(addr(46112)).unwrap();
  socket
    .set_read_timeout(Some(Duration::from_secs(5)))
    .unwrap();
  let select = HsmsMessage::select_req([0, 0, 0, 42]);
  let response = exchange_frame(&mut socket, select.to_bytes());
  assert_eq!(response.control_type(), ControlType::SelectRsp);
  assert_eq!(response.select_status(), Some(SelectStatus::AlreadyUsed));

  // The first session is undisturbed.
  assert!(active.is_communicating());
  active.linktest().unwrap();

  active.close().unwrap();
  passive.close().unwrap();
}

#[test]
fn deselect_req_is_rejected_as_unsupported() {
  let passive = HsmsSsPassiveCommunicator::new(addr(46113), config(true)).unwrap();
  passive.open().unwrap();
  std::thread::sleep(Duration::from_millis(300));

  let mut socket = TcpStream::connect(addr(46113)).unwrap();
  socket
    .set_read_timeout(Some(Duration::from_secs(5)))
    .unwrap();
  let deselect = [0, 0, 0, 10, 0xFF, 0xFF, 0, 0, 0, 3, 0, 0, 0, 5];
  let response = exchange_frame(&mut socket, &deselect);
  assert_eq!(response.control_type(), ControlType::RejectReq);
  assert_eq!(
    response.reject_reason(),
    Some(RejectReason::NotSupportTypeS)
  );

  passive.close().unwrap();
}

#[test]
fn unknown_s_type_is_rejected() {
  let passive = HsmsSsPassiveCommunicator::new(addr(46114), config(true)).unwrap();
  passive.open().unwrap();
  std::thread::sleep(Duration::from_millis(300));

  let mut socket = TcpStream::connect(addr(46114)).unwrap();
  socket
    .set_read_timeout(Some(Duration::from_secs(5)))
    .unwrap();
  let unknown = [0, 0, 0, 10, 0xFF, 0xFF, 0, 0, 0, 8, 0, 0, 0, 6];
  let response = exchange_frame(&mut socket, &unknown);
  assert_eq!(response.control_type(), ControlType::RejectReq);
  assert_eq!(
    response.reject_reason(),
    Some(RejectReason::NotSupportTypeS)
  );

  passive.close().unwrap();
}

#[test]
fn t3_timeout_leaves_the_session_selected() {
  let passive = HsmsSsPassiveCommunicator::new(addr(46115), config(true)).unwrap();
  // No primary listener: the equipment never answers.
  let mut active_config = config(false);
  active_config.timeout_t3 = Duration::from_millis(400);
  let active = HsmsSsActiveCommunicator::new(addr(46115), active_config).unwrap();

  passive.open().unwrap();
  active
    .open_and_wait_until_communicating(Some(Duration::from_secs(5)))
    .unwrap();

  let error = active.send(1, 1, true, None).unwrap_err();
  assert!(matches!(error, HsmsError::T3Timeout));

  // T3 expiry is not fatal to the session.
  assert!(active.is_communicating());
  active.linktest().unwrap();

  active.close().unwrap();
  passive.close().unwrap();
}

#[test]
fn separate_req_tears_the_session_down() {
  let passive = HsmsSsPassiveCommunicator::new(addr(46116), config(true)).unwrap();
  let active = HsmsSsActiveCommunicator::new(addr(46116), config(false)).unwrap();
  passive.open().unwrap();
  active
    .open_and_wait_until_communicating(Some(Duration::from_secs(5)))
    .unwrap();

  let became_not_selected: Arc<std::sync::atomic::AtomicBool> =
    Arc::new(std::sync::atomic::AtomicBool::new(false));
  let flag = became_not_selected.clone();
  passive.add_communicate_listener(move |communicating| {
    if !communicating {
      flag.store(true, std::sync::atomic::Ordering::SeqCst);
    }
  });

  active.separate().unwrap();

  let deadline = std::time::Instant::now() + Duration::from_secs(5);
  while !became_not_selected.load(std::sync::atomic::Ordering::SeqCst) {
    assert!(std::time::Instant::now() < deadline, "separate not observed");
    std::thread::sleep(Duration::from_millis(20));
  }

  active.close().unwrap();
  passive.close().unwrap();
}
