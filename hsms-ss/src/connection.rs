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

//! # HSMS CONNECTION ENGINE
//!
//! One [Connection] per established TCP socket, running three concurrent
//! activities:
//!
//! 1. A byte reader appending socket bytes to the byte queue; EOF or a read
//!    error shuts the connection down.
//! 2. A frame reader pulling exactly 14 bytes (length + header) and then the
//!    body, with T8 bounding the gaps between reads of one frame. Each
//!    assembled message goes to the all-messages hook, then either resolves
//!    a pending send-reply pack or reaches the primary-message hook.
//! 3. Senders, serialized by a mutex. A control request waits under T6 and
//!    its expiry is fatal to the connection; a data message with the W-Bit
//!    waits under T3 and its expiry keeps the connection up; everything
//!    else is fire-and-forget. A REJECT.REQ correlated to a waiter fails it
//!    with [Rejected].
//!
//! [Connection]: HsmsConnection
//! [Rejected]:   crate::HsmsError::Rejected

use crate::message::{ControlType, HsmsMessage};
use crate::HsmsError;
use secs_core::pool::{SendReplyPack, SendReplyPackPool};
use secs_core::queuing::WaitingQueuing;
use secs_core::SecsMessage;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// ## CONNECTION HOOKS
///
/// How the engine hands received messages and failures back to its owner.
/// The primary hook receives the connection so the owner can respond on it.
pub struct ConnectionHooks {
  pub primary: Box<dyn Fn(HsmsMessage, Arc<HsmsConnection>) + Send + Sync>,
  pub all: Box<dyn Fn(HsmsMessage) + Send + Sync>,
  pub sent: Box<dyn Fn(HsmsMessage) + Send + Sync>,
  pub error: Box<dyn Fn(HsmsError) + Send + Sync>,
}

/// ## CONNECTION TIMEOUTS
#[derive(Clone, Copy, Debug)]
pub struct ConnectionTimeouts {
  pub t3: Duration,
  pub t6: Duration,
  pub t8: Duration,
}

/// ## HSMS CONNECTION
///
/// The per-socket engine. Lives from TCP establishment until [Shutdown],
/// which closes the socket, wakes every reply waiter, and releases both
/// reader threads. Shutdown is idempotent.
///
/// [Shutdown]: HsmsConnection::shutdown
pub struct HsmsConnection {
  socket: TcpStream,
  sender: Mutex<TcpStream>,
  bytes: WaitingQueuing<u8>,
  pool: SendReplyPackPool<HsmsMessage>,
  hooks: ConnectionHooks,
  timeouts: ConnectionTimeouts,
  terminated: Mutex<bool>,
  terminated_cdt: Condvar,
}

impl HsmsConnection {
  /// ### START CONNECTION ENGINE
  ///
  /// Clones the socket handle for the sender and spawns the byte reader and
  /// frame reader threads.
  pub fn start(
    socket: TcpStream,
    timeouts: ConnectionTimeouts,
    hooks: ConnectionHooks,
  ) -> std::io::Result<Arc<Self>> {
    let sender = socket.try_clone()?;
    let reader = socket.try_clone()?;
    let connection = Arc::new(HsmsConnection {
      socket,
      sender: Mutex::new(sender),
      bytes: WaitingQueuing::new(),
      pool: SendReplyPackPool::new(),
      hooks,
      timeouts,
      terminated: Mutex::new(false),
      terminated_cdt: Condvar::new(),
    });

    let byte_reader = connection.clone();
    thread::spawn(move || byte_reader.run_byte_reader(reader));

    let frame_reader = connection.clone();
    thread::spawn(move || frame_reader.run_frame_reader());

    Ok(connection)
  }

  /// ### SHUTDOWN
  ///
  /// Idempotent: closes the socket, wakes all reply waiters with a terminal
  /// indication, and releases the reader threads.
  pub fn shutdown(&self) {
    {
      let mut terminated = self.terminated.lock().unwrap_or_else(|e| e.into_inner());
      if *terminated {
        return;
      }
      *terminated = true;
      self.terminated_cdt.notify_all();
    }
    tracing::debug!("hsms connection shutdown");
    self.bytes.shutdown();
    self.pool.shutdown();
    let _ = self.socket.shutdown(Shutdown::Both);
  }

  /// ### IS TERMINATED
  pub fn is_terminated(&self) -> bool {
    *self.terminated.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// ### AWAIT TERMINATION
  ///
  /// Blocks until [Shutdown] completes, or up to `timeout` when one is
  /// given. Returns `true` once terminated.
  ///
  /// [Shutdown]: HsmsConnection::shutdown
  pub fn await_termination(&self, timeout: Option<Duration>) -> bool {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut terminated = self.terminated.lock().unwrap_or_else(|e| e.into_inner());
    loop {
      if *terminated {
        return true;
      }
      match deadline {
        None => {
          terminated = self
            .terminated_cdt
            .wait(terminated)
            .unwrap_or_else(|e| e.into_inner());
        }
        Some(deadline) => {
          let now = Instant::now();
          if now >= deadline {
            return false;
          }
          let (guard, _) = self
            .terminated_cdt
            .wait_timeout(terminated, deadline - now)
            .unwrap_or_else(|e| e.into_inner());
          terminated = guard;
        }
      }
    }
  }

  fn run_byte_reader(&self, mut reader: TcpStream) {
    let mut buf = [0u8; 4096];
    loop {
      if self.is_terminated() {
        break;
      }
      match reader.read(&mut buf) {
        Ok(0) => {
          tracing::debug!("hsms socket closed by peer");
          break;
        }
        Ok(n) => self.bytes.puts(buf[..n].iter().copied()),
        Err(error) => {
          if !self.is_terminated() {
            (self.hooks.error)(HsmsError::Io(error));
          }
          break;
        }
      }
    }
    self.shutdown();
  }

  fn run_frame_reader(self: &Arc<Self>) {
    loop {
      let mut frame: Vec<u8> = Vec::with_capacity(14);

      // The wait for a frame's first bytes is unbounded; T8 only bounds
      // the gaps inside one frame.
      if self.bytes.put_to_buf(&mut frame, 14, None).is_none() {
        break;
      }
      while frame.len() < 14 {
        if self
          .bytes
          .put_to_buf(&mut frame, 14, Some(self.timeouts.t8))
          .is_none()
        {
          self.quit_on_t8();
          return;
        }
      }

      let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
      if declared < 10 {
        (self.hooks.error)(HsmsError::MalformedFrame { length: declared });
        break;
      }
      let total = 4 + declared;
      while frame.len() < total {
        if self
          .bytes
          .put_to_buf(&mut frame, total, Some(self.timeouts.t8))
          .is_none()
        {
          self.quit_on_t8();
          return;
        }
      }

      match HsmsMessage::from_bytes(&frame) {
        Ok(message) => {
          (self.hooks.all)(message.clone());
          if !self.pool.receive(&message) {
            (self.hooks.primary)(message, self.clone());
          }
        }
        Err(error) => {
          (self.hooks.error)(HsmsError::Message(error));
          break;
        }
      }
    }
    self.shutdown();
  }

  fn quit_on_t8(&self) {
    if !self.is_terminated() {
      tracing::warn!("T8 timeout inside a frame");
      (self.hooks.error)(HsmsError::T8Timeout);
    }
    self.shutdown();
  }

  /// ### SEND PROCEDURE
  ///
  /// Serializes the write, then waits for the correlated response when the
  /// message opens a transaction:
  ///
  /// - data with the W-Bit: reply under T3; expiry fails with [T3 Timeout]
  ///   and the connection stays up;
  /// - SELECT.REQ and LINKTEST.REQ: response under T6; expiry fails with
  ///   [T6 Timeout] and shuts the connection down;
  /// - everything else returns as soon as the bytes are written.
  ///
  /// A REJECT.REQ arriving for the transaction fails the waiter with
  /// [Rejected].
  ///
  /// [T3 Timeout]: HsmsError::T3Timeout
  /// [T6 Timeout]: HsmsError::T6Timeout
  /// [Rejected]:   HsmsError::Rejected
  pub fn send(&self, message: HsmsMessage) -> Result<Option<HsmsMessage>, HsmsError> {
    let control_type = message.control_type();
    let reply_timeout = match control_type {
      ControlType::Data if message.w_bit() => Some(self.timeouts.t3),
      ControlType::SelectReq | ControlType::LinktestReq => Some(self.timeouts.t6),
      _ => None,
    };

    let Some(reply_timeout) = reply_timeout else {
      self.transmit(&message)?;
      return Ok(None);
    };

    let pack = SendReplyPack::new(message.clone());
    self.pool.entry(&pack);
    let result = (|| {
      self.transmit(&message)?;
      match pack.wait_reply(reply_timeout) {
        None => {
          if self.is_terminated() {
            Err(HsmsError::Terminated)
          } else if control_type == ControlType::Data {
            Err(HsmsError::T3Timeout)
          } else {
            self.shutdown();
            Err(HsmsError::T6Timeout)
          }
        }
        Some(response) => {
          if response.control_type() == ControlType::RejectReq {
            Err(HsmsError::Rejected {
              reason: response.reject_reason(),
            })
          } else {
            Ok(Some(response))
          }
        }
      }
    })();
    self.pool.remove(&pack);
    result
  }

  fn transmit(&self, message: &HsmsMessage) -> Result<(), HsmsError> {
    if self.is_terminated() {
      return Err(HsmsError::Terminated);
    }
    {
      let mut sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
      sender.write_all(message.to_bytes()).map_err(HsmsError::Io)?;
    }
    (self.hooks.sent)(message.clone());
    Ok(())
  }
}
