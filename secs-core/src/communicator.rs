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

//! # COMMUNICATOR SURFACE
//!
//! The [SECS Communicator] trait is the application-facing façade shared by
//! every session protocol: open and close the communicator, send primary
//! messages (optionally waiting for the correlated reply), reply to received
//! primaries, and do either directly from SML text.
//!
//! [Communicator Base] carries the machinery every concrete communicator
//! embeds: the listener lists with their callback queues, the
//! communicate-state condition, the open/close lifecycle flags, and the
//! system-bytes counter.
//!
//! [SECS Communicator]: SecsCommunicator
//! [Communicator Base]: CommunicatorBase

use crate::queuing::CallbackQueuing;
use crate::{CommunicatorConfig, DynError, SecsMessage};
use atomic::{Atomic, Ordering};
use secs_ii::sml::{self, SmlError};
use secs_ii::Item;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// ## LIFECYCLE ERROR
#[derive(Clone, Debug, PartialEq, Error)]
pub enum LifecycleError {
  /// The communicator was closed; a closed communicator never reopens.
  #[error("communicator already closed")]
  AlreadyClosed,
}

/// ## COMMUNICATE WAIT ERROR
#[derive(Clone, Debug, PartialEq, Error)]
pub enum CommunicateWaitError {
  /// The communicator closed while waiting.
  #[error("communicator closed")]
  Closed,

  /// The communicate state was not reached within the timeout.
  #[error("communicate state wait timed out")]
  Timeout,
}

/// ## SECS COMMUNICATOR
///
/// The application-facing façade of one session protocol endpoint.
///
/// `send` with the W-Bit set blocks until the correlated reply arrives or
/// the reply timeout elapses; without the W-Bit it returns as soon as the
/// message is handed to the session. `reply` reuses the primary message's
/// system bytes.
pub trait SecsCommunicator: Send + Sync {
  type Message: SecsMessage;
  type Error: std::error::Error + From<SmlError> + Send + Sync + 'static;

  /// ### OPEN
  ///
  /// Starts the communicator. A second call is a no-op; a call after
  /// [Close] fails.
  ///
  /// [Close]: SecsCommunicator::close
  fn open(&self) -> Result<(), Self::Error>;

  /// ### CLOSE
  ///
  /// Stops the communicator and unblocks every waiter. Idempotent.
  fn close(&self) -> Result<(), Self::Error>;

  /// ### OPEN AND WAIT UNTIL COMMUNICATING
  ///
  /// Opens if not yet open, then blocks until the session reaches its
  /// communicating state, the timeout elapses, or the communicator closes.
  fn open_and_wait_until_communicating(
    &self,
    timeout: Option<Duration>,
  ) -> Result<(), Self::Error>;

  /// ### IS COMMUNICATING
  fn is_communicating(&self) -> bool;

  /// ### IS EQUIPMENT
  fn is_equip(&self) -> bool;

  /// ### SEND PRIMARY MESSAGE
  fn send(
    &self,
    stream: u8,
    function: u8,
    w_bit: bool,
    body: Option<Item>,
  ) -> Result<Option<Self::Message>, Self::Error>;

  /// ### SEND REPLY MESSAGE
  fn reply(
    &self,
    primary: &Self::Message,
    stream: u8,
    function: u8,
    w_bit: bool,
    body: Option<Item>,
  ) -> Result<(), Self::Error>;

  /// ### SEND PRIMARY MESSAGE FROM SML
  fn send_sml(&self, text: &str) -> Result<Option<Self::Message>, Self::Error> {
    let parsed = sml::parse(text)?;
    self.send(parsed.stream, parsed.function, parsed.w_bit, parsed.body)
  }

  /// ### SEND REPLY MESSAGE FROM SML
  fn reply_sml(&self, primary: &Self::Message, text: &str) -> Result<(), Self::Error> {
    let parsed = sml::parse(text)?;
    self.reply(primary, parsed.stream, parsed.function, parsed.w_bit, parsed.body)
  }
}

type MsgListener<M> = Arc<dyn Fn(&M) + Send + Sync>;
type BoolListener = Arc<dyn Fn(bool) + Send + Sync>;
type ErrListener = Arc<dyn Fn(&(dyn std::error::Error + Send + Sync)) + Send + Sync>;

struct Listeners<M> {
  primary: Mutex<Vec<MsgListener<M>>>,
  all: Mutex<Vec<MsgListener<M>>>,
  sent: Mutex<Vec<MsgListener<M>>>,
  communicate: Mutex<Vec<BoolListener>>,
  error: Mutex<Vec<ErrListener>>,
}

fn snapshot<L: Clone>(list: &Mutex<Vec<L>>) -> Vec<L> {
  list.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

struct CommState {
  communicating: bool,
  closed: bool,
}

struct Lifecycle {
  opened: bool,
  closed: bool,
}

/// ## COMMUNICATOR BASE
///
/// The state every concrete communicator embeds: configuration, listener
/// lists with the callback queues that decouple fan-out from protocol
/// loops, the communicate-state condition, open/close lifecycle, and the
/// system-bytes counter.
pub struct CommunicatorBase<M: SecsMessage> {
  config: CommunicatorConfig,
  listeners: Arc<Listeners<M>>,
  primary_putter: CallbackQueuing<M>,
  all_putter: CallbackQueuing<M>,
  sent_putter: CallbackQueuing<M>,
  communicate_putter: CallbackQueuing<bool>,
  error_putter: CallbackQueuing<DynError>,
  comm_state: Mutex<CommState>,
  comm_cdt: Condvar,
  lifecycle: Mutex<Lifecycle>,
  sys_num: Atomic<u16>,
}

impl<M: SecsMessage> CommunicatorBase<M> {
  /// ### NEW BASE
  pub fn new(config: CommunicatorConfig) -> Self {
    let listeners: Arc<Listeners<M>> = Arc::new(Listeners {
      primary: Mutex::new(vec![]),
      all: Mutex::new(vec![]),
      sent: Mutex::new(vec![]),
      communicate: Mutex::new(vec![]),
      error: Mutex::new(vec![]),
    });
    let for_primary = listeners.clone();
    let for_all = listeners.clone();
    let for_sent = listeners.clone();
    let for_communicate = listeners.clone();
    let for_error = listeners.clone();
    CommunicatorBase {
      config,
      primary_putter: CallbackQueuing::new(move |msg: Option<M>| {
        if let Some(msg) = msg {
          for listener in snapshot(&for_primary.primary) {
            listener(&msg);
          }
        }
      }),
      all_putter: CallbackQueuing::new(move |msg: Option<M>| {
        if let Some(msg) = msg {
          for listener in snapshot(&for_all.all) {
            listener(&msg);
          }
        }
      }),
      sent_putter: CallbackQueuing::new(move |msg: Option<M>| {
        if let Some(msg) = msg {
          for listener in snapshot(&for_sent.sent) {
            listener(&msg);
          }
        }
      }),
      communicate_putter: CallbackQueuing::new(move |state: Option<bool>| {
        if let Some(state) = state {
          for listener in snapshot(&for_communicate.communicate) {
            listener(state);
          }
        }
      }),
      error_putter: CallbackQueuing::new(move |error: Option<DynError>| {
        if let Some(error) = error {
          for listener in snapshot(&for_error.error) {
            listener(error.as_ref());
          }
        }
      }),
      listeners,
      comm_state: Mutex::new(CommState {
        communicating: false,
        closed: false,
      }),
      comm_cdt: Condvar::new(),
      lifecycle: Mutex::new(Lifecycle {
        opened: false,
        closed: false,
      }),
      sys_num: Atomic::new(0),
    }
  }

  /// ### CONFIGURATION
  pub fn config(&self) -> &CommunicatorConfig {
    &self.config
  }

  // LISTENER REGISTRATION

  /// ### ADD RECEIVED-PRIMARY-MESSAGE LISTENER
  pub fn add_primary_msg_listener(&self, listener: impl Fn(&M) + Send + Sync + 'static) {
    self
      .listeners
      .primary
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(Arc::new(listener));
  }

  /// ### ADD RECEIVED-ALL-MESSAGES LISTENER
  pub fn add_all_msg_listener(&self, listener: impl Fn(&M) + Send + Sync + 'static) {
    self
      .listeners
      .all
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(Arc::new(listener));
  }

  /// ### ADD SENT-MESSAGE LISTENER
  pub fn add_sent_msg_listener(&self, listener: impl Fn(&M) + Send + Sync + 'static) {
    self
      .listeners
      .sent
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(Arc::new(listener));
  }

  /// ### ADD COMMUNICATE-STATE LISTENER
  ///
  /// The new listener is invoked immediately with the current state, then
  /// on every change.
  pub fn add_communicate_listener(&self, listener: impl Fn(bool) + Send + Sync + 'static) {
    let listener: BoolListener = Arc::new(listener);
    let current = {
      let state = self.comm_state.lock().unwrap_or_else(|e| e.into_inner());
      self
        .listeners
        .communicate
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(listener.clone());
      state.communicating
    };
    listener(current);
  }

  /// ### ADD ERROR LISTENER
  pub fn add_error_listener(
    &self,
    listener: impl Fn(&(dyn std::error::Error + Send + Sync)) + Send + Sync + 'static,
  ) {
    self
      .listeners
      .error
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(Arc::new(listener));
  }

  // QUEUED DELIVERY

  /// ### DELIVER RECEIVED PRIMARY MESSAGE
  pub fn put_primary_msg(&self, msg: M) {
    self.primary_putter.put(msg);
  }

  /// ### DELIVER RECEIVED MESSAGE
  pub fn put_all_msg(&self, msg: M) {
    self.all_putter.put(msg);
  }

  /// ### DELIVER SENT MESSAGE
  pub fn put_sent_msg(&self, msg: M) {
    self.sent_putter.put(msg);
  }

  /// ### DELIVER ERROR
  pub fn put_error(&self, error: impl Into<DynError>) {
    let error = error.into();
    tracing::warn!(error = %error, "communicator error");
    self.error_putter.put(error);
  }

  // COMMUNICATE STATE

  /// ### PUT COMMUNICATE STATE
  ///
  /// Records the state and, when it changed, wakes waiters and notifies
  /// communicate listeners.
  pub fn put_communicated(&self, communicating: bool) {
    let mut state = self.comm_state.lock().unwrap_or_else(|e| e.into_inner());
    if state.communicating != communicating {
      state.communicating = communicating;
      self.comm_cdt.notify_all();
      drop(state);
      tracing::debug!(communicating, "communicate state changed");
      self.communicate_putter.put(communicating);
    }
  }

  /// ### IS COMMUNICATING
  pub fn is_communicating(&self) -> bool {
    self
      .comm_state
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .communicating
  }

  /// ### WAIT UNTIL COMMUNICATING
  pub fn wait_until_communicating(
    &self,
    timeout: Option<Duration>,
  ) -> Result<(), CommunicateWaitError> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut state = self.comm_state.lock().unwrap_or_else(|e| e.into_inner());
    loop {
      if state.closed {
        return Err(CommunicateWaitError::Closed);
      }
      if state.communicating {
        return Ok(());
      }
      match deadline {
        None => {
          state = self
            .comm_cdt
            .wait(state)
            .unwrap_or_else(|e| e.into_inner());
        }
        Some(deadline) => {
          let now = Instant::now();
          if now >= deadline {
            return Err(CommunicateWaitError::Timeout);
          }
          let (guard, _) = self
            .comm_cdt
            .wait_timeout(state, deadline - now)
            .unwrap_or_else(|e| e.into_inner());
          state = guard;
        }
      }
    }
  }

  /// ### WAIT FOR CLOSE
  ///
  /// Blocks up to `timeout` or until the communicator closes; returns
  /// `true` when it closed. Reconnect and rebind loops sleep through this
  /// so that [Begin Close] interrupts them.
  ///
  /// [Begin Close]: CommunicatorBase::begin_close
  pub fn wait_closed(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut state = self.comm_state.lock().unwrap_or_else(|e| e.into_inner());
    loop {
      if state.closed {
        return true;
      }
      let now = Instant::now();
      if now >= deadline {
        return false;
      }
      let (guard, _) = self
        .comm_cdt
        .wait_timeout(state, deadline - now)
        .unwrap_or_else(|e| e.into_inner());
      state = guard;
    }
  }

  // LIFECYCLE

  /// ### BEGIN OPEN
  ///
  /// Returns `Ok(true)` when the caller should proceed with opening,
  /// `Ok(false)` when the communicator is already open (a no-op), and an
  /// error when it was closed.
  pub fn begin_open(&self) -> Result<bool, LifecycleError> {
    let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
    if lifecycle.closed {
      return Err(LifecycleError::AlreadyClosed);
    }
    if lifecycle.opened {
      return Ok(false);
    }
    lifecycle.opened = true;
    Ok(true)
  }

  /// ### BEGIN CLOSE
  ///
  /// Marks the communicator closed and wakes communicate-state waiters.
  /// Returns `false` when it was already closed (a no-op).
  pub fn begin_close(&self) -> bool {
    {
      let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
      if lifecycle.closed {
        return false;
      }
      lifecycle.closed = true;
    }
    let mut state = self.comm_state.lock().unwrap_or_else(|e| e.into_inner());
    state.closed = true;
    self.comm_cdt.notify_all();
    true
  }

  /// ### IS OPEN
  pub fn is_open(&self) -> bool {
    let lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
    lifecycle.opened && !lifecycle.closed
  }

  /// ### IS CLOSED
  pub fn is_closed(&self) -> bool {
    self
      .lifecycle
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .closed
  }

  /// ### SHUTDOWN LISTENER QUEUES
  ///
  /// Stops the callback queues after close; pending deliveries complete
  /// first. Idempotent.
  pub fn shutdown_putters(&self) {
    self.primary_putter.shutdown();
    self.all_putter.shutdown();
    self.sent_putter.shutdown();
    self.communicate_putter.shutdown();
    self.error_putter.shutdown();
  }

  // SYSTEM BYTES

  /// ### CREATE SYSTEM BYTES
  ///
  /// Mints the next system bytes: the device id in the high half when
  /// acting as equipment, and a process-monotonic 16-bit counter in the low
  /// half. The counter wraps modulo 2^16.
  pub fn create_system_bytes(&self) -> [u8; 4] {
    let n = self.sys_num.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    let d = if self.config.is_equip {
      self.config.device_id
    } else {
      0
    };
    [((d >> 8) & 0x7F) as u8, (d & 0xFF) as u8, (n >> 8) as u8, (n & 0xFF) as u8]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};
  use std::sync::mpsc;

  #[derive(Clone, Debug, PartialEq)]
  struct TestMessage {
    system: [u8; 4],
  }

  impl SecsMessage for TestMessage {
    fn stream(&self) -> u8 {
      0
    }
    fn function(&self) -> u8 {
      0
    }
    fn w_bit(&self) -> bool {
      false
    }
    fn body(&self) -> Option<&Item> {
      None
    }
    fn system_bytes(&self) -> [u8; 4] {
      self.system
    }
    fn device_id(&self) -> u16 {
      10
    }
    fn header10(&self) -> [u8; 10] {
      [0; 10]
    }
  }

  fn new_base(is_equip: bool) -> CommunicatorBase<TestMessage> {
    CommunicatorBase::new(CommunicatorConfig::new(10, is_equip))
  }

  #[test]
  fn system_bytes_carry_device_id_for_equipment() {
    let base = new_base(true);
    assert_eq!(base.create_system_bytes(), [0, 10, 0, 1]);
    assert_eq!(base.create_system_bytes(), [0, 10, 0, 2]);
    let host = new_base(false);
    assert_eq!(host.create_system_bytes(), [0, 0, 0, 1]);
  }

  #[test]
  fn system_bytes_are_unique_across_threads() {
    let base = Arc::new(new_base(false));
    let mut handles = vec![];
    for _ in 0..4 {
      let base = base.clone();
      handles.push(std::thread::spawn(move || {
        (0..256).map(|_| base.create_system_bytes()).collect::<Vec<_>>()
      }));
    }
    let mut all: Vec<[u8; 4]> = handles
      .into_iter()
      .flat_map(|h| h.join().unwrap())
      .collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 4 * 256);
  }

  #[test]
  fn sent_listener_observes_submit_order() {
    let base = new_base(false);
    let (tx, rx) = mpsc::channel::<[u8; 4]>();
    base.add_sent_msg_listener(move |m| {
      let _ = tx.send(m.system_bytes());
    });
    for i in 0..10u8 {
      base.put_sent_msg(TestMessage {
        system: [0, 0, 0, i],
      });
    }
    for i in 0..10u8 {
      assert_eq!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        [0, 0, 0, i]
      );
    }
  }

  #[test]
  fn communicate_listener_fires_immediately_and_on_change() {
    let base = new_base(false);
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let (tx, rx) = mpsc::channel::<bool>();
    base.add_communicate_listener(move |state| {
      seen.fetch_add(1, StdOrdering::SeqCst);
      let _ = tx.send(state);
    });
    assert!(!rx.recv_timeout(Duration::from_secs(1)).unwrap());
    base.put_communicated(true);
    assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
    // No change, no callback.
    base.put_communicated(true);
    base.put_communicated(false);
    assert!(!rx.recv_timeout(Duration::from_secs(1)).unwrap());
    assert_eq!(count.load(StdOrdering::SeqCst), 3);
  }

  #[test]
  fn open_close_lifecycle_is_idempotent() {
    let base = new_base(false);
    assert_eq!(base.begin_open(), Ok(true));
    assert_eq!(base.begin_open(), Ok(false));
    assert!(base.is_open());
    assert!(base.begin_close());
    assert!(!base.begin_close());
    assert!(base.is_closed());
    assert_eq!(base.begin_open(), Err(LifecycleError::AlreadyClosed));
  }

  #[test]
  fn wait_until_communicating_times_out_and_sees_close() {
    let base = Arc::new(new_base(false));
    assert_eq!(
      base.wait_until_communicating(Some(Duration::from_millis(30))),
      Err(CommunicateWaitError::Timeout)
    );
    let waiter = base.clone();
    let handle =
      std::thread::spawn(move || waiter.wait_until_communicating(Some(Duration::from_secs(5))));
    std::thread::sleep(Duration::from_millis(30));
    base.begin_close();
    assert_eq!(handle.join().unwrap(), Err(CommunicateWaitError::Closed));
  }
}
