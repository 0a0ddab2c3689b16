// Copyright © 2024 Nathaniel Hardesty
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the “Software”), to
// deal in the Software without restriction, including without limitation the
// rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
// sell copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
// IN THE SOFTWARE.

//! # HSMS-SS PASSIVE COMMUNICATOR
//!
//! The listening side of a single-session HSMS link. It accepts any number
//! of TCP connections, but only one may complete the select procedure; a
//! SELECT.REQ on any further connection is answered with ALREADY-USED and
//! that connection stays open until SEPARATE.REQ or its T7 window expires.
//!
//! A connection that does not select within T7 is closed. When the listen
//! socket fails, the communicator waits the rebind separation and binds
//! again.

use crate::communicator::{HsmsCommunicateState, HsmsCommunicatorInner};
use crate::connection::HsmsConnection;
use crate::message::{ControlType, HsmsMessage, RejectReason, SelectStatus};
use crate::HsmsError;
use secs_core::queuing::WaitingQueuing;
use secs_core::{
  CommunicateWaitError, CommunicatorConfig, SecsCommunicator, SecsMessage,
};
use secs_ii::Item;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

type MsgAndConn = (HsmsMessage, Arc<HsmsConnection>);

/// ## PASSIVE COMMUNICATOR
/// **Based on SEMI E37-1109§6.3.4 ("Passive mode")**
///
/// Create with [New], then [Open]; the communicator binds, accepts, and
/// rebinds until [Close].
///
/// [New]:   HsmsSsPassiveCommunicator::new
/// [Open]:  SecsCommunicator::open
/// [Close]: SecsCommunicator::close
pub struct HsmsSsPassiveCommunicator {
  inner: Arc<HsmsCommunicatorInner>,
  address: SocketAddr,
}

impl HsmsSsPassiveCommunicator {
  /// ### NEW PASSIVE COMMUNICATOR
  ///
  /// `address` is the local address to listen on.
  pub fn new(
    address: SocketAddr,
    config: CommunicatorConfig,
  ) -> Result<Arc<Self>, HsmsError> {
    config.validate()?;
    Ok(Arc::new(HsmsSsPassiveCommunicator {
      inner: HsmsCommunicatorInner::new(config),
      address,
    }))
  }

  /// ### PARAMETER SETTINGS
  pub fn config(&self) -> &CommunicatorConfig {
    self.inner.base.config()
  }

  /// ### CURRENT COMMUNICATE STATE
  pub fn communicate_state(&self) -> HsmsCommunicateState {
    self.inner.state()
  }

  /// ### ADD COMMUNICATE-STATE LISTENER
  pub fn add_state_listener(
    &self,
    listener: impl Fn(HsmsCommunicateState) + Send + Sync + 'static,
  ) {
    self.inner.add_state_listener(listener);
  }

  /// ### ADD RECEIVED-PRIMARY-MESSAGE LISTENER
  pub fn add_primary_msg_listener(
    &self,
    listener: impl Fn(&HsmsMessage) + Send + Sync + 'static,
  ) {
    self.inner.base.add_primary_msg_listener(listener);
  }

  /// ### ADD RECEIVED-ALL-MESSAGES LISTENER
  pub fn add_all_msg_listener(&self, listener: impl Fn(&HsmsMessage) + Send + Sync + 'static) {
    self.inner.base.add_all_msg_listener(listener);
  }

  /// ### ADD SENT-MESSAGE LISTENER
  pub fn add_sent_msg_listener(&self, listener: impl Fn(&HsmsMessage) + Send + Sync + 'static) {
    self.inner.base.add_sent_msg_listener(listener);
  }

  /// ### ADD COMMUNICATE LISTENER
  pub fn add_communicate_listener(&self, listener: impl Fn(bool) + Send + Sync + 'static) {
    self.inner.base.add_communicate_listener(listener);
  }

  /// ### ADD ERROR LISTENER
  pub fn add_error_listener(
    &self,
    listener: impl Fn(&(dyn std::error::Error + Send + Sync)) + Send + Sync + 'static,
  ) {
    self.inner.base.add_error_listener(listener);
  }

  /// ### LINKTEST PROCEDURE
  pub fn linktest(&self) -> Result<(), HsmsError> {
    self.inner.send_hsms_msg(self.inner.build_linktest_req())?;
    Ok(())
  }
}

impl SecsCommunicator for HsmsSsPassiveCommunicator {
  type Message = HsmsMessage;
  type Error = HsmsError;

  fn open(&self) -> Result<(), HsmsError> {
    match self.inner.base.begin_open() {
      Ok(true) => {
        let inner = self.inner.clone();
        let address = self.address;
        thread::spawn(move || run_accept_loop(inner, address));
        Ok(())
      }
      Ok(false) => Ok(()),
      Err(_) => Err(HsmsError::AlreadyClosed),
    }
  }

  fn close(&self) -> Result<(), HsmsError> {
    if !self.inner.base.begin_close() {
      return Ok(());
    }
    self.inner.shutdown_live();
    self.inner.base.shutdown_putters();
    self.inner.shutdown_state_putter();
    Ok(())
  }

  fn open_and_wait_until_communicating(
    &self,
    timeout: Option<Duration>,
  ) -> Result<(), HsmsError> {
    self.open()?;
    self
      .inner
      .base
      .wait_until_communicating(timeout)
      .map_err(|error| match error {
        CommunicateWaitError::Closed => HsmsError::AlreadyClosed,
        CommunicateWaitError::Timeout => HsmsError::WaitCommunicatingTimeout,
      })
  }

  fn is_communicating(&self) -> bool {
    self.inner.base.is_communicating()
  }

  fn is_equip(&self) -> bool {
    self.inner.base.config().is_equip
  }

  fn send(
    &self,
    stream: u8,
    function: u8,
    w_bit: bool,
    body: Option<Item>,
  ) -> Result<Option<HsmsMessage>, HsmsError> {
    let system_bytes = self.inner.base.create_system_bytes();
    self.inner.send_data(stream, function, w_bit, body, system_bytes)
  }

  fn reply(
    &self,
    primary: &HsmsMessage,
    stream: u8,
    function: u8,
    w_bit: bool,
    body: Option<Item>,
  ) -> Result<(), HsmsError> {
    self
      .inner
      .send_data(stream, function, w_bit, body, primary.system_bytes())?;
    Ok(())
  }
}

/// Bind, accept until the listener fails, wait the rebind separation, bind
/// again; until close.
fn run_accept_loop(inner: Arc<HsmsCommunicatorInner>, address: SocketAddr) {
  let rebind = inner.base.config().timeout_rebind;
  while !inner.base.is_closed() {
    bind_and_accept(&inner, address);
    if inner.base.is_closed() {
      break;
    }
    inner.base.wait_closed(rebind);
  }
  tracing::debug!("passive accept loop exited");
}

fn bind_and_accept(inner: &Arc<HsmsCommunicatorInner>, address: SocketAddr) {
  let listener = match TcpListener::bind(address) {
    Ok(listener) => listener,
    Err(error) => {
      tracing::debug!(%address, error = %error, "bind failed");
      return;
    }
  };
  if let Err(error) = listener.set_nonblocking(true) {
    inner.base.put_error(HsmsError::Io(error));
    return;
  }
  tracing::info!(%address, "listening");

  loop {
    if inner.base.is_closed() {
      return;
    }
    match listener.accept() {
      Ok((socket, peer)) => {
        tracing::debug!(%peer, "accepted");
        let inner = inner.clone();
        thread::spawn(move || handle_socket(inner, socket));
      }
      Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
        thread::sleep(ACCEPT_POLL);
      }
      Err(error) => {
        if !inner.base.is_closed() {
          inner.base.put_error(HsmsError::Io(error));
        }
        return;
      }
    }
  }
}

/// One accepted socket: engine, T7-bounded select phase, then the selected
/// session until the connection dies.
fn handle_socket(inner: Arc<HsmsCommunicatorInner>, socket: TcpStream) {
  if socket.set_nonblocking(false).is_err() {
    return;
  }
  let _ = socket.set_nodelay(true);

  let queue: Arc<WaitingQueuing<MsgAndConn>> = Arc::new(WaitingQueuing::new());
  let feed = queue.clone();
  let hooks = inner.hooks(move |message, connection| {
    feed.put((message, connection));
  });
  let connection = match HsmsConnection::start(socket, inner.timeouts(), hooks) {
    Ok(connection) => connection,
    Err(error) => {
      inner.base.put_error(HsmsError::Io(error));
      return;
    }
  };
  inner.register_live(&connection);
  inner.put_state_connected();

  // Release the receive loops below once the engine dies.
  {
    let watched = connection.clone();
    let queue = queue.clone();
    thread::spawn(move || {
      watched.await_termination(None);
      queue.shutdown();
    });
  }

  if receive_until_selected(&inner, &queue) {
    receive_selected(&inner, &queue);
    if inner.unset_selected_connection(&connection) {
      inner.put_state(HsmsCommunicateState::NotConnected);
    }
  }

  connection.shutdown();
  inner.unregister_live(&connection);
}

/// The select phase: each poll is bounded by T7; expiry (or SEPARATE.REQ)
/// gives up the connection. Returns `true` when this connection won the
/// selected slot.
fn receive_until_selected(
  inner: &Arc<HsmsCommunicatorInner>,
  queue: &Arc<WaitingQueuing<MsgAndConn>>,
) -> bool {
  let t7 = inner.base.config().timeout_t7;
  while !inner.base.is_closed() {
    let Some((message, connection)) = queue.poll(Some(t7)) else {
      tracing::debug!("T7 expired before select");
      return false;
    };
    if inner.dispatch_common(&message, &connection) {
      continue;
    }
    match message.control_type() {
      ControlType::Data => {
        inner.send_ignore(
          &connection,
          HsmsMessage::reject_req(&message, RejectReason::NotSelected),
        );
      }
      ControlType::SelectReq => {
        if inner.set_selected_connection(&connection) {
          inner.put_state(HsmsCommunicateState::Selected);
          inner.send_ignore(
            &connection,
            HsmsMessage::select_rsp(&message, SelectStatus::Success),
          );
          return true;
        } else {
          inner.send_ignore(
            &connection,
            HsmsMessage::select_rsp(&message, SelectStatus::AlreadyUsed),
          );
        }
      }
      ControlType::SeparateReq => return false,
      _ => {}
    }
  }
  false
}

/// The selected session: data flows to the primary listeners; a repeated
/// SELECT.REQ is acknowledged as already active; SEPARATE.REQ ends the
/// session.
fn receive_selected(
  inner: &Arc<HsmsCommunicatorInner>,
  queue: &Arc<WaitingQueuing<MsgAndConn>>,
) {
  while !inner.base.is_closed() {
    let Some((message, connection)) = queue.poll(None) else {
      return;
    };
    if inner.dispatch_common(&message, &connection) {
      continue;
    }
    match message.control_type() {
      ControlType::Data => inner.base.put_primary_msg(message),
      ControlType::SelectReq => {
        inner.send_ignore(
          &connection,
          HsmsMessage::select_rsp(&message, SelectStatus::AlreadyActive),
        );
      }
      ControlType::SeparateReq => return,
      _ => {}
    }
  }
}
