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

//! # HSMS-SS ACTIVE COMMUNICATOR
//!
//! The connecting side of a single-session HSMS link. Its loop connects to
//! the passive entity, initiates the select procedure, and holds the
//! selected session until the connection dies; it then waits T5 and
//! reconnects.

use crate::communicator::{HsmsCommunicateState, HsmsCommunicatorInner};
use crate::connection::HsmsConnection;
use crate::message::{ControlType, HsmsMessage, RejectReason, SelectStatus};
use crate::HsmsError;
use secs_core::{
  CommunicateWaitError, CommunicatorConfig, SecsCommunicator, SecsMessage,
};
use secs_ii::Item;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// ## ACTIVE COMMUNICATOR
/// **Based on SEMI E37-1109§6.3.4 ("Active mode")**
///
/// Create with [New], then [Open]; the communicator connects, selects, and
/// reconnects with a T5 separation until [Close].
///
/// [New]:   HsmsSsActiveCommunicator::new
/// [Open]:  SecsCommunicator::open
/// [Close]: SecsCommunicator::close
pub struct HsmsSsActiveCommunicator {
  inner: Arc<HsmsCommunicatorInner>,
  address: SocketAddr,
}

impl HsmsSsActiveCommunicator {
  /// ### NEW ACTIVE COMMUNICATOR
  ///
  /// `address` is the passive entity to connect to.
  pub fn new(
    address: SocketAddr,
    config: CommunicatorConfig,
  ) -> Result<Arc<Self>, HsmsError> {
    config.validate()?;
    Ok(Arc::new(HsmsSsActiveCommunicator {
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
  ///
  /// Sends LINKTEST.REQ through the selected session and waits under T6.
  pub fn linktest(&self) -> Result<(), HsmsError> {
    self.inner.send_hsms_msg(self.inner.build_linktest_req())?;
    Ok(())
  }

  /// ### SEPARATE PROCEDURE
  ///
  /// Sends SEPARATE.REQ; the passive entity closes the connection.
  pub fn separate(&self) -> Result<(), HsmsError> {
    self.inner.send_hsms_msg(self.inner.build_separate_req())?;
    Ok(())
  }
}

impl SecsCommunicator for HsmsSsActiveCommunicator {
  type Message = HsmsMessage;
  type Error = HsmsError;

  fn open(&self) -> Result<(), HsmsError> {
    match self.inner.base.begin_open() {
      Ok(true) => {
        let inner = self.inner.clone();
        let address = self.address;
        thread::spawn(move || run_connect_loop(inner, address));
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

/// Connect, select, hold; then wait T5 and try again, until close.
fn run_connect_loop(inner: Arc<HsmsCommunicatorInner>, address: SocketAddr) {
  let t5 = inner.base.config().timeout_t5;
  while !inner.base.is_closed() {
    connect_once(&inner, address);
    if inner.base.is_closed() {
      break;
    }
    inner.base.wait_closed(t5);
  }
  tracing::debug!("active connect loop exited");
}

fn connect_once(inner: &Arc<HsmsCommunicatorInner>, address: SocketAddr) {
  let t5 = inner.base.config().timeout_t5;
  let socket = match TcpStream::connect_timeout(&address, t5) {
    Ok(socket) => socket,
    Err(error) => {
      tracing::debug!(%address, error = %error, "connect attempt failed");
      return;
    }
  };
  let _ = socket.set_nodelay(true);

  let for_dispatch = inner.clone();
  let hooks = inner.hooks(move |message, connection| {
    dispatch_active(&for_dispatch, message, &connection);
  });
  let connection = match HsmsConnection::start(socket, inner.timeouts(), hooks) {
    Ok(connection) => connection,
    Err(error) => {
      inner.base.put_error(HsmsError::Io(error));
      return;
    }
  };
  inner.register_live(&connection);
  inner.put_state(HsmsCommunicateState::Connected);

  match connection.send(inner.build_select_req()) {
    Ok(Some(response)) => match response.select_status() {
      Some(SelectStatus::Success) | Some(SelectStatus::AlreadyActive) => {
        if inner.set_selected_connection(&connection) {
          inner.put_state(HsmsCommunicateState::Selected);
          connection.await_termination(None);
          inner.unset_selected_connection(&connection);
        }
      }
      _ => {
        inner.base.put_error(HsmsError::SelectFailed {
          status: response.header10()[3],
        });
      }
    },
    Ok(None) => {}
    Err(error) => {
      if !inner.base.is_closed() {
        inner.base.put_error(error);
      }
    }
  }

  connection.shutdown();
  inner.unregister_live(&connection);
  inner.put_state(HsmsCommunicateState::NotConnected);
}

/// The active role's receive dispatch.
fn dispatch_active(
  inner: &Arc<HsmsCommunicatorInner>,
  message: HsmsMessage,
  connection: &Arc<HsmsConnection>,
) {
  if inner.dispatch_common(&message, connection) {
    return;
  }
  match message.control_type() {
    ControlType::Data => {
      if inner.state() == HsmsCommunicateState::Selected {
        inner.base.put_primary_msg(message);
      } else {
        inner.send_ignore(
          connection,
          HsmsMessage::reject_req(&message, RejectReason::NotSelected),
        );
      }
    }
    // Only the passive entity is the select responder in HSMS-SS.
    ControlType::SelectReq => {
      inner.send_ignore(
        connection,
        HsmsMessage::reject_req(&message, RejectReason::NotSupportTypeS),
      );
    }
    ControlType::SeparateReq => connection.shutdown(),
    _ => {}
  }
}
