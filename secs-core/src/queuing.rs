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

//! # CONCURRENT QUEUING
//!
//! Multiple-producer, single-consumer queues used throughout the session
//! protocols:
//!
//! - [Callback Queuing] owns a dedicated consumer thread which delivers each
//!   value to a callback in FIFO order, so that slow listeners cannot stall
//!   protocol loops. On shutdown the callback receives `None` exactly once
//!   and the thread exits.
//! - [Waiting Queuing] is a blocking poll with optional timeout, returning
//!   `None` on shutdown or timeout. The byte-valued instantiation
//!   additionally supports filling a buffer toward an exact size and
//!   draining inbound bytes until silence.
//!
//! Shutdown is idempotent on every queue; after shutdown, all pending and
//! future operations unblock with a terminal indication.
//!
//! [Callback Queuing]: CallbackQueuing
//! [Waiting Queuing]:  WaitingQueuing

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

struct QueueState<T> {
  values: VecDeque<T>,
  terminated: bool,
}

struct QueueInner<T> {
  state: Mutex<QueueState<T>>,
  cdt: Condvar,
}

impl<T> QueueInner<T> {
  fn new() -> Self {
    QueueInner {
      state: Mutex::new(QueueState {
        values: VecDeque::new(),
        terminated: false,
      }),
      cdt: Condvar::new(),
    }
  }

  fn put(&self, value: T) {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if !state.terminated {
      state.values.push_back(value);
      self.cdt.notify_all();
    }
  }

  fn puts(&self, values: impl IntoIterator<Item = T>) {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if !state.terminated {
      state.values.extend(values);
      self.cdt.notify_all();
    }
  }

  fn shutdown(&self) {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    state.terminated = true;
    self.cdt.notify_all();
  }
}

/// ## CALLBACK QUEUING
///
/// A queue with a dedicated consumer thread: every value put into the queue
/// is handed to the callback in FIFO order, off the producer's thread. After
/// [Shutdown] the callback is invoked once with `None` and the consumer
/// thread exits.
///
/// [Shutdown]: CallbackQueuing::shutdown
pub struct CallbackQueuing<T: Send + 'static> {
  inner: Arc<QueueInner<T>>,
}

impl<T: Send + 'static> CallbackQueuing<T> {
  /// ### NEW CALLBACK QUEUE
  ///
  /// Starts the consumer thread.
  pub fn new(mut callback: impl FnMut(Option<T>) + Send + 'static) -> Self {
    let inner: Arc<QueueInner<T>> = Arc::new(QueueInner::new());
    let consumer = inner.clone();
    thread::spawn(move || loop {
      let next: Option<T> = {
        let mut state = consumer.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
          if let Some(value) = state.values.pop_front() {
            break Some(value);
          }
          if state.terminated {
            break None;
          }
          state = consumer
            .cdt
            .wait(state)
            .unwrap_or_else(|e| e.into_inner());
        }
      };
      match next {
        Some(value) => callback(Some(value)),
        None => {
          callback(None);
          return;
        }
      }
    });
    CallbackQueuing { inner }
  }

  /// ### PUT
  ///
  /// Enqueues one value for delivery. Values put after shutdown are
  /// discarded.
  pub fn put(&self, value: T) {
    self.inner.put(value);
  }

  /// ### SHUTDOWN
  ///
  /// Stops the consumer after all pending values have been delivered.
  /// Idempotent.
  pub fn shutdown(&self) {
    self.inner.shutdown();
  }
}

impl<T: Send + 'static> Drop for CallbackQueuing<T> {
  fn drop(&mut self) {
    self.inner.shutdown();
  }
}

/// ## WAITING QUEUING
///
/// A blocking poll queue. Producers [Put] values; the consumer [Poll]s with
/// an optional timeout and receives `None` on shutdown or timeout.
///
/// [Put]:  WaitingQueuing::put
/// [Poll]: WaitingQueuing::poll
pub struct WaitingQueuing<T> {
  inner: QueueInner<T>,
}

impl<T> Default for WaitingQueuing<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> WaitingQueuing<T> {
  pub fn new() -> Self {
    WaitingQueuing {
      inner: QueueInner::new(),
    }
  }

  /// ### PUT
  pub fn put(&self, value: T) {
    self.inner.put(value);
  }

  /// ### PUT MANY
  pub fn puts(&self, values: impl IntoIterator<Item = T>) {
    self.inner.puts(values);
  }

  /// ### POLL
  ///
  /// Takes the next value, blocking up to `timeout` (forever when `None`).
  /// Returns `None` on shutdown or when the timeout elapses with the queue
  /// empty.
  pub fn poll(&self, timeout: Option<Duration>) -> Option<T> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
    loop {
      if state.terminated {
        return None;
      }
      if let Some(value) = state.values.pop_front() {
        return Some(value);
      }
      match deadline {
        None => {
          state = self
            .inner
            .cdt
            .wait(state)
            .unwrap_or_else(|e| e.into_inner());
        }
        Some(deadline) => {
          let now = Instant::now();
          if now >= deadline {
            return None;
          }
          let (guard, _) = self
            .inner
            .cdt
            .wait_timeout(state, deadline - now)
            .unwrap_or_else(|e| e.into_inner());
          state = guard;
        }
      }
    }
  }

  /// ### SHUTDOWN
  ///
  /// Unblocks all waiters with `None`. Idempotent.
  pub fn shutdown(&self) {
    self.inner.shutdown();
  }

  /// ### IS TERMINATED
  pub fn is_terminated(&self) -> bool {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .terminated
  }

  /// ### CLEAR
  ///
  /// Discards all pending values.
  pub fn clear(&self) {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .values
      .clear();
  }
}

/// ## BYTE ACCUMULATION
///
/// The receive loops of both session protocols pull wire bytes from a
/// [Waiting Queuing] of `u8`, filling fixed-size reads under a timeout.
///
/// [Waiting Queuing]: WaitingQueuing
impl WaitingQueuing<u8> {
  /// ### FILL TOWARD TARGET
  ///
  /// Appends pending bytes to `buf`, never growing it beyond `target`
  /// bytes, blocking up to `timeout` for the first byte. Returns the number
  /// of bytes appended, or `None` on shutdown or timeout. Callers loop
  /// until `buf` reaches `target`.
  pub fn put_to_buf(
    &self,
    buf: &mut Vec<u8>,
    target: usize,
    timeout: Option<Duration>,
  ) -> Option<usize> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
    loop {
      if state.terminated {
        return None;
      }
      let room = target.saturating_sub(buf.len());
      if room == 0 {
        return Some(0);
      }
      if !state.values.is_empty() {
        let take = state.values.len().min(room);
        buf.extend(state.values.drain(..take));
        return Some(take);
      }
      match deadline {
        None => {
          state = self
            .inner
            .cdt
            .wait(state)
            .unwrap_or_else(|e| e.into_inner());
        }
        Some(deadline) => {
          let now = Instant::now();
          if now >= deadline {
            return None;
          }
          let (guard, _) = self
            .inner
            .cdt
            .wait_timeout(state, deadline - now)
            .unwrap_or_else(|e| e.into_inner());
          state = guard;
        }
      }
    }
  }

  /// ### DRAIN UNTIL SILENCE
  ///
  /// Discards pending bytes, then keeps discarding any byte that arrives
  /// within `timeout` of the previous one. Used by the SECS-I circuit to
  /// flush the line after a sum-check failure.
  pub fn garbage(&self, timeout: Duration) {
    self.clear();
    while self.poll(Some(timeout)).is_some() {}
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc;

  #[test]
  fn callback_queue_delivers_fifo_then_none_on_shutdown() {
    let (tx, rx) = mpsc::channel::<Option<u32>>();
    let queue: CallbackQueuing<u32> = CallbackQueuing::new(move |v| {
      let _ = tx.send(v);
    });
    queue.put(1);
    queue.put(2);
    queue.put(3);
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some(1));
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some(2));
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some(3));
    queue.shutdown();
    queue.shutdown();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);
    // The consumer thread is gone; the channel hangs up with it.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
  }

  #[test]
  fn waiting_queue_poll_times_out() {
    let queue: WaitingQueuing<u8> = WaitingQueuing::new();
    assert_eq!(queue.poll(Some(Duration::from_millis(20))), None);
    queue.put(7);
    assert_eq!(queue.poll(Some(Duration::from_millis(20))), Some(7));
  }

  #[test]
  fn waiting_queue_unblocks_on_shutdown() {
    let queue: Arc<WaitingQueuing<u8>> = Arc::new(WaitingQueuing::new());
    let waiter = queue.clone();
    let handle = thread::spawn(move || waiter.poll(None));
    thread::sleep(Duration::from_millis(50));
    queue.shutdown();
    assert_eq!(handle.join().unwrap(), None);
    // Terminated queues stay terminated.
    queue.put(1);
    assert_eq!(queue.poll(Some(Duration::from_millis(10))), None);
  }

  #[test]
  fn put_to_buf_fills_toward_target() {
    let queue: WaitingQueuing<u8> = WaitingQueuing::new();
    queue.puts([1, 2, 3, 4, 5]);
    let mut buf: Vec<u8> = vec![];
    let n = queue
      .put_to_buf(&mut buf, 3, Some(Duration::from_millis(50)))
      .unwrap();
    assert_eq!(n, 3);
    assert_eq!(buf, vec![1, 2, 3]);
    let n = queue
      .put_to_buf(&mut buf, 5, Some(Duration::from_millis(50)))
      .unwrap();
    assert_eq!(n, 2);
    assert_eq!(buf, vec![1, 2, 3, 4, 5]);
    assert_eq!(
      queue.put_to_buf(&mut buf, 6, Some(Duration::from_millis(20))),
      None
    );
  }

  #[test]
  fn garbage_drains_until_silence() {
    let queue: Arc<WaitingQueuing<u8>> = Arc::new(WaitingQueuing::new());
    queue.puts([1, 2, 3]);
    let feeder = queue.clone();
    let handle = thread::spawn(move || {
      for _ in 0..3 {
        thread::sleep(Duration::from_millis(10));
        feeder.put(9);
      }
    });
    queue.garbage(Duration::from_millis(100));
    handle.join().unwrap();
    assert_eq!(queue.poll(Some(Duration::from_millis(10))), None);
  }
}
