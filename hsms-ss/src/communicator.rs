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

//! # HSMS-SS SESSION CORE
//!
//! The state shared by the [Active] and [Passive] communicators: the
//! communicate-state cell with its listeners, the single `selected`
//! connection slot (compare-and-set, so that of two racing clients the
//! second is told ALREADY-USED), the registry of live connections that
//! `close` must tear down, and the control-message dispatch arms common to
//! both roles.
//!
//! [Active]:  crate::HsmsSsActiveCommunicator
//! [Passive]: crate::HsmsSsPassiveCommunicator

use crate::connection::{ConnectionHooks, ConnectionTimeouts, HsmsConnection};
use crate::message::{ControlType, HsmsMessage, RejectReason};
use crate::HsmsError;
use atomic::{Atomic, Ordering};
use bytemuck::NoUninit;
use secs_core::queuing::CallbackQueuing;
use secs_core::{CommunicatorBase, CommunicatorConfig};
use std::sync::{Arc, Mutex};

/// ## HSMS-SS COMMUNICATE STATE
/// **Based on SEMI E37.1-0702§4**
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, NoUninit)]
pub enum HsmsCommunicateState {
  /// No TCP connection is established.
  NotConnected = 0,
  /// A TCP connection exists but the select procedure has not completed.
  Connected = 1,
  /// The select procedure completed; data messages may flow.
  Selected = 2,
}

type StateListener = Arc<dyn Fn(HsmsCommunicateState) + Send + Sync>;

/// ## SESSION CORE
///
/// Owned in an `Arc` by one role communicator; connection hooks and loop
/// threads hold clones.
pub(crate) struct HsmsCommunicatorInner {
  pub(crate) base: CommunicatorBase<HsmsMessage>,
  selected: Mutex<Option<Arc<HsmsConnection>>>,
  live: Mutex<Vec<Arc<HsmsConnection>>>,
  state: Atomic<HsmsCommunicateState>,
  state_listeners: Arc<Mutex<Vec<StateListener>>>,
  state_putter: CallbackQueuing<HsmsCommunicateState>,
}

impl HsmsCommunicatorInner {
  pub(crate) fn new(config: CommunicatorConfig) -> Arc<Self> {
    let state_listeners: Arc<Mutex<Vec<StateListener>>> = Arc::new(Mutex::new(vec![]));
    let fan_out = state_listeners.clone();
    Arc::new(HsmsCommunicatorInner {
      base: CommunicatorBase::new(config),
      selected: Mutex::new(None),
      live: Mutex::new(vec![]),
      state: Atomic::new(HsmsCommunicateState::NotConnected),
      state_listeners,
      state_putter: CallbackQueuing::new(move |state: Option<HsmsCommunicateState>| {
        if let Some(state) = state {
          let listeners = fan_out.lock().unwrap_or_else(|e| e.into_inner()).clone();
          for listener in listeners {
            listener(state);
          }
        }
      }),
    })
  }

  pub(crate) fn timeouts(&self) -> ConnectionTimeouts {
    let config = self.base.config();
    ConnectionTimeouts {
      t3: config.timeout_t3,
      t6: config.timeout_t6,
      t8: config.timeout_t8,
    }
  }

  // COMMUNICATE STATE

  pub(crate) fn state(&self) -> HsmsCommunicateState {
    self.state.load(Ordering::SeqCst)
  }

  /// Records the state; on change, notifies state listeners and folds the
  /// state into the generic communicate flag (communicating == SELECTED).
  pub(crate) fn put_state(&self, state: HsmsCommunicateState) {
    let previous = self.state.swap(state, Ordering::SeqCst);
    if previous != state {
      tracing::info!(?state, "hsms-ss communicate state");
      self.state_putter.put(state);
      self
        .base
        .put_communicated(state == HsmsCommunicateState::Selected);
    }
  }

  /// NOT-CONNECTED -> CONNECTED only; an extra passive socket must not
  /// disturb a SELECTED session.
  pub(crate) fn put_state_connected(&self) {
    if self
      .state
      .compare_exchange(
        HsmsCommunicateState::NotConnected,
        HsmsCommunicateState::Connected,
        Ordering::SeqCst,
        Ordering::SeqCst,
      )
      .is_ok()
    {
      tracing::info!("hsms-ss communicate state: Connected");
      self.state_putter.put(HsmsCommunicateState::Connected);
    }
  }

  /// The new listener fires immediately with the current state, then on
  /// every change.
  pub(crate) fn add_state_listener(
    &self,
    listener: impl Fn(HsmsCommunicateState) + Send + Sync + 'static,
  ) {
    let listener: StateListener = Arc::new(listener);
    self
      .state_listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(listener.clone());
    listener(self.state());
  }

  pub(crate) fn shutdown_state_putter(&self) {
    self.state_putter.shutdown();
  }

  // SELECTED CONNECTION SLOT

  /// Compare-and-set on the single selected slot. Returns `false` when the
  /// slot is already taken.
  pub(crate) fn set_selected_connection(&self, connection: &Arc<HsmsConnection>) -> bool {
    let mut slot = self.selected.lock().unwrap_or_else(|e| e.into_inner());
    if slot.is_none() {
      *slot = Some(connection.clone());
      true
    } else {
      false
    }
  }

  /// Clears the slot when it still holds this connection. Returns whether
  /// it did.
  pub(crate) fn unset_selected_connection(&self, connection: &Arc<HsmsConnection>) -> bool {
    let mut slot = self.selected.lock().unwrap_or_else(|e| e.into_inner());
    match &*slot {
      Some(held) if Arc::ptr_eq(held, connection) => {
        *slot = None;
        true
      }
      _ => false,
    }
  }

  /// ### SEND THROUGH THE SELECTED CONNECTION
  pub(crate) fn send_hsms_msg(
    &self,
    message: HsmsMessage,
  ) -> Result<Option<HsmsMessage>, HsmsError> {
    let connection = self
      .selected
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
      .ok_or(HsmsError::NotConnected)?;
    connection.send(message)
  }

  /// ### SEND DATA MESSAGE
  pub(crate) fn send_data(
    &self,
    stream: u8,
    function: u8,
    w_bit: bool,
    body: Option<secs_ii::Item>,
    system_bytes: [u8; 4],
  ) -> Result<Option<HsmsMessage>, HsmsError> {
    let message = HsmsMessage::data(
      self.base.config().device_id,
      stream,
      function,
      w_bit,
      body,
      system_bytes,
    )?;
    self.send_hsms_msg(message)
  }

  // LIVE CONNECTION REGISTRY

  pub(crate) fn register_live(&self, connection: &Arc<HsmsConnection>) {
    self
      .live
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(connection.clone());
  }

  pub(crate) fn unregister_live(&self, connection: &Arc<HsmsConnection>) {
    self
      .live
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .retain(|held| !Arc::ptr_eq(held, connection));
  }

  pub(crate) fn shutdown_live(&self) {
    let connections: Vec<Arc<HsmsConnection>> = self
      .live
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone();
    for connection in connections {
      connection.shutdown();
    }
  }

  // DISPATCH HELPERS

  /// Sends on the connection, routing any failure to the error listeners
  /// rather than up into the protocol loop.
  pub(crate) fn send_ignore(&self, connection: &Arc<HsmsConnection>, message: HsmsMessage) {
    if let Err(error) = connection.send(message) {
      if !self.base.is_closed() {
        self.base.put_error(error);
      }
    }
  }

  /// REJECT.REQ for an undefined control message: NOT-SUPPORT-TYPE-P when
  /// only the P-Type is foreign, NOT-SUPPORT-TYPE-S otherwise.
  pub(crate) fn reject_undefined(&self, message: &HsmsMessage, connection: &Arc<HsmsConnection>) {
    let reason = if ControlType::known_s_type(message.s_type()) {
      RejectReason::NotSupportTypeP
    } else {
      RejectReason::NotSupportTypeS
    };
    self.send_ignore(connection, HsmsMessage::reject_req(message, reason));
  }

  /// The dispatch arms identical in both roles and in both passive phases.
  /// Returns `false` for the role-specific message kinds (data, SELECT.REQ,
  /// SEPARATE.REQ).
  pub(crate) fn dispatch_common(
    &self,
    message: &HsmsMessage,
    connection: &Arc<HsmsConnection>,
  ) -> bool {
    match message.control_type() {
      ControlType::LinktestReq => {
        self.send_ignore(connection, HsmsMessage::linktest_rsp(message));
        true
      }
      // A response that resolved no open transaction.
      ControlType::SelectRsp | ControlType::LinktestRsp => {
        self.send_ignore(
          connection,
          HsmsMessage::reject_req(message, RejectReason::TransactionNotOpen),
        );
        true
      }
      // Deselect is not part of the single-session subset.
      ControlType::DeselectReq | ControlType::DeselectRsp => {
        self.send_ignore(
          connection,
          HsmsMessage::reject_req(message, RejectReason::NotSupportTypeS),
        );
        true
      }
      ControlType::RejectReq => true,
      ControlType::Undefined { .. } => {
        self.reject_undefined(message, connection);
        true
      }
      ControlType::Data | ControlType::SelectReq | ControlType::SeparateReq => false,
    }
  }

  /// Hooks wiring a connection's all/sent/error paths into the listener
  /// queues; the primary path is role-specific.
  pub(crate) fn hooks(
    self: &Arc<Self>,
    primary: impl Fn(HsmsMessage, Arc<HsmsConnection>) + Send + Sync + 'static,
  ) -> ConnectionHooks {
    let for_all = self.clone();
    let for_sent = self.clone();
    let for_error = self.clone();
    ConnectionHooks {
      primary: Box::new(primary),
      all: Box::new(move |message| for_all.base.put_all_msg(message)),
      sent: Box::new(move |message| for_sent.base.put_sent_msg(message)),
      error: Box::new(move |error| {
        if !for_error.base.is_closed() {
          for_error.base.put_error(error);
        }
      }),
    }
  }

  /// Builds the SELECT.REQ for the active role's handshake.
  pub(crate) fn build_select_req(&self) -> HsmsMessage {
    HsmsMessage::select_req(self.base.create_system_bytes())
  }

  /// Builds a LINKTEST.REQ.
  pub(crate) fn build_linktest_req(&self) -> HsmsMessage {
    HsmsMessage::linktest_req(self.base.create_system_bytes())
  }

  /// Builds a SEPARATE.REQ.
  pub(crate) fn build_separate_req(&self) -> HsmsMessage {
    HsmsMessage::separate_req(self.base.create_system_bytes())
  }
}
