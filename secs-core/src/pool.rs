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

//! # SEND-REPLY CORRELATION
//!
//! When a primary message is sent with the W-Bit, the initiator registers a
//! [Send Reply Pack] keyed by the message's system bytes. The receive path
//! resolves the pack when a message with matching system bytes arrives;
//! otherwise the message is a primary message for the application.
//!
//! SECS-I additionally extends a pack's reply deadline whenever an
//! intermediate block of a long reply arrives ([Timer Reset]), and records
//! the moment the last block of the primary goes over the wire
//! ([Notify Sent]).
//!
//! [Send Reply Pack]: SendReplyPack
//! [Timer Reset]:     SendReplyPack::notify_timer_reset
//! [Notify Sent]:     SendReplyPack::notify_sent

use crate::SecsMessage;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// ## PACK FAILURE
///
/// Terminal failure of a registered transaction, delivered to the thread
/// waiting inside the pack.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum PackFailure {
  /// The SECS-I circuit exhausted its retries for a block of the primary.
  #[error("send retry count exceeded")]
  RetryOver,

  /// The transport refused the outgoing bytes.
  #[error("send failed: {0}")]
  SendFailed(String),

  /// The owning connection or communicator shut down while the transaction
  /// was open.
  #[error("connection terminated")]
  Terminated,
}

#[derive(Debug)]
struct PackState<M> {
  sent: bool,
  failure: Option<PackFailure>,
  reply: Option<M>,
  timer_reset: bool,
  terminated: bool,
}

/// ## SEND REPLY PACK
///
/// One correlation slot: the primary message, a sent flag, a failure slot,
/// a reply slot, and a timer-reset flag, all guarded by one lock with one
/// condition variable. A pack lives for the duration of a single
/// transaction.
pub struct SendReplyPack<M> {
  primary: M,
  state: Mutex<PackState<M>>,
  cdt: Condvar,
}

impl<M: SecsMessage> SendReplyPack<M> {
  /// ### NEW PACK
  pub fn new(primary: M) -> Arc<Self> {
    Arc::new(SendReplyPack {
      primary,
      state: Mutex::new(PackState {
        sent: false,
        failure: None,
        reply: None,
        timer_reset: false,
        terminated: false,
      }),
      cdt: Condvar::new(),
    })
  }

  /// ### PRIMARY MESSAGE
  pub fn primary(&self) -> &M {
    &self.primary
  }

  /// ### SYSTEM BYTES KEY
  pub fn system_bytes(&self) -> [u8; 4] {
    self.primary.system_bytes()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, PackState<M>> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// ### NOTIFY SENT
  ///
  /// Marks the primary as fully on the wire.
  pub fn notify_sent(&self) {
    let mut state = self.lock();
    state.sent = true;
    self.cdt.notify_all();
  }

  /// ### NOTIFY FAILURE
  pub fn notify_failure(&self, failure: PackFailure) {
    let mut state = self.lock();
    if state.failure.is_none() {
      state.failure = Some(failure);
    }
    self.cdt.notify_all();
  }

  /// ### NOTIFY REPLY
  pub fn notify_reply(&self, reply: M) {
    let mut state = self.lock();
    state.reply = Some(reply);
    self.cdt.notify_all();
  }

  /// ### NOTIFY TIMER RESET
  ///
  /// Re-arms the reply deadline of a waiter inside [Wait Reply]. Fired for
  /// every received block whose system bytes match this pack.
  ///
  /// [Wait Reply]: SendReplyPack::wait_reply
  pub fn notify_timer_reset(&self) {
    let mut state = self.lock();
    state.timer_reset = true;
    self.cdt.notify_all();
  }

  /// ### SHUTDOWN
  ///
  /// Unblocks all waiters with a terminal indication. Idempotent.
  pub fn shutdown(&self) {
    let mut state = self.lock();
    state.terminated = true;
    self.cdt.notify_all();
  }

  /// ### IS TERMINATED
  pub fn is_terminated(&self) -> bool {
    self.lock().terminated
  }

  /// ### WAIT UNTIL SENT
  ///
  /// Blocks until the primary is fully on the wire, the transaction fails,
  /// or the pack shuts down.
  pub fn wait_until_sent(&self) -> Result<(), PackFailure> {
    let mut state = self.lock();
    loop {
      if let Some(failure) = &state.failure {
        return Err(failure.clone());
      }
      if state.sent {
        return Ok(());
      }
      if state.terminated {
        return Err(PackFailure::Terminated);
      }
      state = self.cdt.wait(state).unwrap_or_else(|e| e.into_inner());
    }
  }

  /// ### WAIT REPLY
  ///
  /// Blocks up to `timeout` for the reply. Every [Timer Reset] restarts the
  /// full timeout window, so a long multi-block reply completes as long as
  /// no inter-block gap exceeds the timeout. Returns `None` when the
  /// deadline passes without a reset, or on shutdown.
  ///
  /// [Timer Reset]: SendReplyPack::notify_timer_reset
  pub fn wait_reply(&self, timeout: Duration) -> Option<M> {
    let mut state = self.lock();
    let mut deadline = Instant::now() + timeout;
    state.timer_reset = false;
    loop {
      if let Some(reply) = state.reply.take() {
        return Some(reply);
      }
      if state.terminated {
        return None;
      }
      if state.timer_reset {
        state.timer_reset = false;
        deadline = Instant::now() + timeout;
      }
      let now = Instant::now();
      if now >= deadline {
        return None;
      }
      let (guard, _) = self
        .cdt
        .wait_timeout(state, deadline - now)
        .unwrap_or_else(|e| e.into_inner());
      state = guard;
    }
  }
}

/// ## SEND REPLY PACK POOL
///
/// The open transactions of one connection, keyed by system bytes. The
/// minter must not reuse a system id while a pack is live, so at most one
/// pack per key is registered at a time.
pub struct SendReplyPackPool<M> {
  packs: Mutex<HashMap<[u8; 4], Arc<SendReplyPack<M>>>>,
}

impl<M: SecsMessage> Default for SendReplyPackPool<M> {
  fn default() -> Self {
    Self::new()
  }
}

impl<M: SecsMessage> SendReplyPackPool<M> {
  pub fn new() -> Self {
    SendReplyPackPool {
      packs: Mutex::new(HashMap::new()),
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<[u8; 4], Arc<SendReplyPack<M>>>> {
    self.packs.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// ### REGISTER
  pub fn entry(&self, pack: &Arc<SendReplyPack<M>>) {
    self.lock().insert(pack.system_bytes(), pack.clone());
  }

  /// ### DEREGISTER
  pub fn remove(&self, pack: &Arc<SendReplyPack<M>>) {
    self.lock().remove(&pack.system_bytes());
  }

  /// ### DELIVER REPLY
  ///
  /// Resolves the pack registered under the reply's system bytes. Returns
  /// `false` when no transaction is open for them, in which case the caller
  /// treats the message as a primary message.
  pub fn receive(&self, reply: &M) -> bool {
    let pack = self.lock().get(&reply.system_bytes()).cloned();
    match pack {
      Some(pack) => {
        pack.notify_reply(reply.clone());
        true
      }
      None => false,
    }
  }

  /// ### TIMER RESET
  ///
  /// Re-arms the reply deadline of the pack registered under the given
  /// system bytes, if any.
  pub fn timer_reset(&self, system_bytes: [u8; 4]) {
    if let Some(pack) = self.lock().get(&system_bytes) {
      pack.notify_timer_reset();
    }
  }

  /// ### SHUTDOWN
  ///
  /// Wakes every registered pack with a terminal indication. Idempotent.
  pub fn shutdown(&self) {
    for pack in self.lock().values() {
      pack.shutdown();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::SecsMessage;
  use std::thread;

  #[derive(Clone, Debug, PartialEq)]
  struct TestMessage {
    system: [u8; 4],
    function: u8,
  }

  impl SecsMessage for TestMessage {
    fn stream(&self) -> u8 {
      1
    }
    fn function(&self) -> u8 {
      self.function
    }
    fn w_bit(&self) -> bool {
      false
    }
    fn body(&self) -> Option<&secs_ii::Item> {
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

  fn msg(system: [u8; 4], function: u8) -> TestMessage {
    TestMessage { system, function }
  }

  #[test]
  fn reply_resolves_registered_pack() {
    let pool: SendReplyPackPool<TestMessage> = SendReplyPackPool::new();
    let pack = SendReplyPack::new(msg([0, 0, 0, 1], 1));
    pool.entry(&pack);

    assert!(pool.receive(&msg([0, 0, 0, 1], 2)));
    assert!(!pool.receive(&msg([0, 0, 0, 9], 2)));

    let reply = pack.wait_reply(Duration::from_millis(100)).unwrap();
    assert_eq!(reply.function, 2);

    pool.remove(&pack);
    assert!(!pool.receive(&msg([0, 0, 0, 1], 2)));
  }

  #[test]
  fn wait_reply_times_out() {
    let pack = SendReplyPack::new(msg([0, 0, 0, 2], 1));
    let start = Instant::now();
    assert!(pack.wait_reply(Duration::from_millis(50)).is_none());
    assert!(start.elapsed() >= Duration::from_millis(50));
  }

  #[test]
  fn timer_reset_extends_the_deadline() {
    let pack = SendReplyPack::new(msg([0, 0, 0, 3], 1));
    let waiter = pack.clone();
    let handle = thread::spawn(move || waiter.wait_reply(Duration::from_millis(120)));

    // Three resets, each inside the window, then the reply, well past the
    // original deadline.
    for _ in 0..3 {
      thread::sleep(Duration::from_millis(80));
      pack.notify_timer_reset();
    }
    thread::sleep(Duration::from_millis(60));
    pack.notify_reply(msg([0, 0, 0, 3], 2));

    let reply = handle.join().unwrap();
    assert_eq!(reply.unwrap().function, 2);
  }

  #[test]
  fn shutdown_unblocks_waiters() {
    let pack = SendReplyPack::new(msg([0, 0, 0, 4], 1));
    let waiter = pack.clone();
    let handle = thread::spawn(move || waiter.wait_reply(Duration::from_secs(10)));
    thread::sleep(Duration::from_millis(30));
    pack.shutdown();
    pack.shutdown();
    assert!(handle.join().unwrap().is_none());
    assert_eq!(pack.wait_until_sent(), Err(PackFailure::Terminated));
  }

  #[test]
  fn wait_until_sent_sees_failure() {
    let pack = SendReplyPack::new(msg([0, 0, 0, 5], 1));
    pack.notify_failure(PackFailure::RetryOver);
    assert_eq!(pack.wait_until_sent(), Err(PackFailure::RetryOver));
  }
}
