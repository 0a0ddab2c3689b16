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

//! # SECS-I CIRCUIT
//! **Based on SEMI E4§9**
//!
//! The half-duplex line discipline. One circuit thread alternates between
//! the sender and receiver roles of the ENQ/EOT/ACK/NAK handshake:
//!
//! - To send, emit ENQ and wait T2 for EOT. An incoming ENQ instead means
//!   contention: the master keeps the line, the slave yields and receives.
//!   On EOT, emit one framed block and wait T2 for ACK. A single retry
//!   counter spans line acquisition and per-block NAKs; it resets only on a
//!   successfully transmitted block.
//! - To receive (driven by an incoming ENQ), reply EOT, read the length
//!   byte under T2 and the rest of the block under T1 per read, verify the
//!   checksum, and ACK or NAK. Blocks accumulate in the reassembly buffer
//!   obeying continuity; duplicates are dropped; a non-continuous block
//!   restarts the buffer. After an intermediate block the circuit waits T4
//!   for the next ENQ.
//!
//! Every irregularity is published as a [Circuit Event] so hosts can log
//! the line behavior without the circuit stalling on them.
//!
//! [Circuit Event]: CircuitEvent

use crate::message::{sum_check_frame, Secs1Message, Secs1MessageBlock};
use crate::Secs1Error;
use secs_core::pool::{PackFailure, SendReplyPack, SendReplyPackPool};
use secs_core::queuing::CallbackQueuing;
use secs_core::{CommunicatorBase, CommunicatorConfig, SecsMessage};
use std::collections::VecDeque;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const ENQ: u8 = 0x05;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;

/// ## CIRCUIT EVENT
///
/// An irregularity observed on the line, published to circuit-event
/// listeners. None of these abort the circuit; retries and the reassembly
/// rules recover from them.
#[derive(Clone, Debug)]
pub enum CircuitEvent {
  /// No EOT (or contending ENQ) arrived within T2 of our ENQ.
  T2TimeoutWaitEot,
  /// No ACK arrived within T2 of a transmitted block.
  T2TimeoutWaitAck { block: Secs1MessageBlock },
  /// A block transmission failed and the shared retry counter advanced.
  RetryCountUp { count: u32 },
  /// Something other than ACK answered a transmitted block.
  NotAck { block: Secs1MessageBlock, received: u8 },
  /// No length byte arrived within T2 of our EOT.
  T2TimeoutLengthByte,
  /// The length byte was outside [10, 254].
  LengthByteError { length: u8 },
  /// A gap between bytes of an incoming block exceeded T1.
  T1Timeout { position: usize },
  /// An incoming block failed its checksum; the line was drained and NAKed.
  SumCheckError { bytes: Vec<u8> },
  /// An incoming block carried a foreign device id.
  DeviceIdMismatch { device_id: u16 },
  /// No ENQ for the next block arrived within T4.
  T4Timeout { previous: Secs1MessageBlock },
  /// Something other than ENQ arrived where the next block was expected.
  NotEnqNextBlock { previous: Secs1MessageBlock, received: u8 },
}

/// One value pulled off the circuit queue.
enum Polled {
  Pack(Arc<SendReplyPack<Secs1Message>>),
  Byte(u8),
  Terminated,
}

struct CircuitQueueState {
  bytes: VecDeque<u8>,
  packs: VecDeque<Arc<SendReplyPack<Secs1Message>>>,
  terminated: bool,
}

/// The circuit's single wait point: inbound wire bytes and outbound message
/// packs share one condition so the circuit thread can block on either.
struct CircuitQueue {
  state: Mutex<CircuitQueueState>,
  cdt: Condvar,
}

impl CircuitQueue {
  fn new() -> Self {
    CircuitQueue {
      state: Mutex::new(CircuitQueueState {
        bytes: VecDeque::new(),
        packs: VecDeque::new(),
        terminated: false,
      }),
      cdt: Condvar::new(),
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, CircuitQueueState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn put_recv_bytes(&self, bytes: &[u8]) {
    let mut state = self.lock();
    if !state.terminated {
      state.bytes.extend(bytes.iter().copied());
      self.cdt.notify_all();
    }
  }

  fn entry_pack(&self, pack: &Arc<SendReplyPack<Secs1Message>>) {
    let mut state = self.lock();
    if state.terminated {
      pack.notify_failure(PackFailure::Terminated);
    } else {
      state.packs.push_back(pack.clone());
      self.cdt.notify_all();
    }
  }

  fn shutdown(&self) {
    let mut state = self.lock();
    state.terminated = true;
    for pack in state.packs.drain(..) {
      pack.notify_failure(PackFailure::Terminated);
    }
    self.cdt.notify_all();
  }

  /// Blocks until a pack or a byte is available. Packs take priority so a
  /// queued message is attempted at the next idle moment.
  fn poll_either(&self) -> Polled {
    let mut state = self.lock();
    loop {
      if state.terminated {
        return Polled::Terminated;
      }
      if let Some(pack) = state.packs.pop_front() {
        return Polled::Pack(pack);
      }
      if let Some(byte) = state.bytes.pop_front() {
        return Polled::Byte(byte);
      }
      state = self.cdt.wait(state).unwrap_or_else(|e| e.into_inner());
    }
  }

  fn poll_byte(&self, timeout: Duration) -> Option<u8> {
    let deadline = Instant::now() + timeout;
    let mut state = self.lock();
    loop {
      if state.terminated {
        return None;
      }
      if let Some(byte) = state.bytes.pop_front() {
        return Some(byte);
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

  /// Appends pending bytes to `buf` up to `target` bytes total, blocking up
  /// to `timeout` for the first byte. `None` on shutdown or timeout.
  fn put_to_buf(&self, buf: &mut Vec<u8>, target: usize, timeout: Duration) -> Option<usize> {
    let deadline = Instant::now() + timeout;
    let mut state = self.lock();
    loop {
      if state.terminated {
        return None;
      }
      let room = target.saturating_sub(buf.len());
      if room == 0 {
        return Some(0);
      }
      if !state.bytes.is_empty() {
        let take = state.bytes.len().min(room);
        buf.extend(state.bytes.drain(..take));
        return Some(take);
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

  /// Discards pending bytes, then any byte arriving within `timeout` of the
  /// previous one.
  fn garbage(&self, timeout: Duration) {
    self.lock().bytes.clear();
    while self.poll_byte(timeout).is_some() {}
  }
}

type BlockListener = Arc<dyn Fn(&Secs1MessageBlock) + Send + Sync>;
type EventListener = Arc<dyn Fn(&CircuitEvent) + Send + Sync>;

/// Listener list plus the callback queue decoupling delivery from the
/// circuit thread.
struct ListenerQueue<T: Send + 'static> {
  listeners: Arc<Mutex<Vec<Arc<dyn Fn(&T) + Send + Sync>>>>,
  putter: CallbackQueuing<T>,
}

impl<T: Send + 'static> ListenerQueue<T> {
  fn new() -> Self {
    let listeners: Arc<Mutex<Vec<Arc<dyn Fn(&T) + Send + Sync>>>> = Arc::new(Mutex::new(vec![]));
    let fan_out = listeners.clone();
    ListenerQueue {
      listeners,
      putter: CallbackQueuing::new(move |value: Option<T>| {
        if let Some(value) = value {
          let listeners = fan_out.lock().unwrap_or_else(|e| e.into_inner()).clone();
          for listener in listeners {
            listener(&value);
          }
        }
      }),
    }
  }

  fn add(&self, listener: Arc<dyn Fn(&T) + Send + Sync>) {
    self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(listener);
  }

  fn put(&self, value: T) {
    self.putter.put(value);
  }

  fn shutdown(&self) {
    self.putter.shutdown();
  }
}

/// ## SECS-I ENGINE
///
/// The protocol state shared by the TCP/IP communicators: the circuit
/// queue, the send-reply pool, the registered transport sockets, and the
/// block/event listeners. The reassembly buffer is owned by the circuit
/// thread and never shared.
pub(crate) struct Secs1Engine {
  pub(crate) base: CommunicatorBase<Secs1Message>,
  queue: CircuitQueue,
  pool: SendReplyPackPool<Secs1Message>,
  sockets: Mutex<Vec<(u64, TcpStream)>>,
  socket_ids: AtomicU64,
  recv_block_listeners: ListenerQueue<Secs1MessageBlock>,
  try_send_block_listeners: ListenerQueue<Secs1MessageBlock>,
  sent_block_listeners: ListenerQueue<Secs1MessageBlock>,
  event_listeners: ListenerQueue<CircuitEvent>,
}

impl Secs1Engine {
  pub(crate) fn new(config: CommunicatorConfig) -> Arc<Self> {
    Arc::new(Secs1Engine {
      base: CommunicatorBase::new(config),
      queue: CircuitQueue::new(),
      pool: SendReplyPackPool::new(),
      sockets: Mutex::new(vec![]),
      socket_ids: AtomicU64::new(0),
      recv_block_listeners: ListenerQueue::new(),
      try_send_block_listeners: ListenerQueue::new(),
      sent_block_listeners: ListenerQueue::new(),
      event_listeners: ListenerQueue::new(),
    })
  }

  // LISTENERS

  pub(crate) fn add_recv_block_listener(&self, listener: BlockListener) {
    self.recv_block_listeners.add(listener);
  }

  pub(crate) fn add_try_send_block_listener(&self, listener: BlockListener) {
    self.try_send_block_listeners.add(listener);
  }

  pub(crate) fn add_sent_block_listener(&self, listener: BlockListener) {
    self.sent_block_listeners.add(listener);
  }

  pub(crate) fn add_circuit_event_listener(&self, listener: EventListener) {
    self.event_listeners.add(listener);
  }

  fn put_event(&self, event: CircuitEvent) {
    tracing::debug!(?event, "secs-i circuit event");
    self.event_listeners.put(event);
  }

  // TRANSPORT SOCKETS

  /// Registers a transport socket; the circuit is communicating while at
  /// least one is registered.
  pub(crate) fn add_socket(&self, socket: TcpStream) -> u64 {
    let id = self.socket_ids.fetch_add(1, Ordering::Relaxed);
    let mut sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
    sockets.push((id, socket));
    self.base.put_communicated(!sockets.is_empty());
    id
  }

  pub(crate) fn remove_socket(&self, id: u64) {
    let mut sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
    sockets.retain(|(held, _)| *held != id);
    self.base.put_communicated(!sockets.is_empty());
  }

  pub(crate) fn shutdown_sockets(&self) {
    let sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
    for (_, socket) in sockets.iter() {
      let _ = socket.shutdown(Shutdown::Both);
    }
  }

  fn send_bytes(&self, bytes: &[u8]) -> Result<(), Secs1Error> {
    let mut sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
    if sockets.is_empty() {
      return Err(Secs1Error::NotConnected);
    }
    for (_, socket) in sockets.iter_mut() {
      socket.write_all(bytes).map_err(Secs1Error::Io)?;
    }
    Ok(())
  }

  /// Sends a line-control byte; a transport failure is reported rather than
  /// propagated, matching how the circuit treats other line irregularities.
  fn send_control(&self, byte: u8) -> bool {
    match self.send_bytes(&[byte]) {
      Ok(()) => true,
      Err(error) => {
        if !self.base.is_closed() {
          self.base.put_error(error);
        }
        false
      }
    }
  }

  // INBOUND BYTES

  pub(crate) fn put_recv_bytes(&self, bytes: &[u8]) {
    self.queue.put_recv_bytes(bytes);
  }

  // LIFECYCLE

  pub(crate) fn start_circuit(self: &Arc<Self>) {
    let engine = self.clone();
    std::thread::spawn(move || engine.run_circuit());
  }

  pub(crate) fn shutdown(&self) {
    self.queue.shutdown();
    self.pool.shutdown();
    self.shutdown_sockets();
    self.recv_block_listeners.shutdown();
    self.try_send_block_listeners.shutdown();
    self.sent_block_listeners.shutdown();
    self.event_listeners.shutdown();
    self.base.shutdown_putters();
  }

  // SEND PATH

  /// ### SEND MESSAGE PROCEDURE
  ///
  /// Registers the send-reply pack, queues the message for the circuit,
  /// waits until its last block is acknowledged, then (with the W-Bit)
  /// waits under T3 for the reply. Intermediate blocks of a long reply
  /// re-arm the T3 window through the pool.
  pub(crate) fn send_secs1_msg(
    &self,
    message: Secs1Message,
  ) -> Result<Option<Secs1Message>, Secs1Error> {
    if self.base.is_closed() {
      return Err(Secs1Error::AlreadyClosed);
    }
    let timeout_t3 = self.base.config().timeout_t3;
    let w_bit = message.w_bit();
    let pack = SendReplyPack::new(message);
    self.pool.entry(&pack);
    let result = (|| {
      self.queue.entry_pack(&pack);
      pack.wait_until_sent().map_err(|failure| match failure {
        PackFailure::RetryOver => Secs1Error::RetryOver,
        PackFailure::SendFailed(reason) => Secs1Error::SendFailed(reason),
        PackFailure::Terminated => Secs1Error::Terminated,
      })?;
      self.base.put_sent_msg(pack.primary().clone());
      if w_bit {
        match pack.wait_reply(timeout_t3) {
          Some(reply) => Ok(Some(reply)),
          None => {
            if pack.is_terminated() {
              Err(Secs1Error::Terminated)
            } else {
              Err(Secs1Error::T3Timeout)
            }
          }
        }
      } else {
        Ok(None)
      }
    })();
    self.pool.remove(&pack);
    result
  }

  // CIRCUIT

  fn run_circuit(&self) {
    // Owned by this thread for the life of the circuit.
    let mut recv_blocks: Vec<Secs1MessageBlock> = vec![];
    loop {
      match self.queue.poll_either() {
        Polled::Terminated => {
          tracing::debug!("secs-i circuit exited");
          return;
        }
        Polled::Pack(pack) => self.send_pack(&pack, &mut recv_blocks),
        Polled::Byte(ENQ) => self.receive_transfer(&mut recv_blocks),
        Polled::Byte(_) => {}
      }
    }
  }

  /// The sender role for one message: acquire the line, then one block at
  /// a time. The retry counter spans line acquisition and per-block NAKs
  /// and resets only on a successfully transmitted block.
  fn send_pack(
    &self,
    pack: &Arc<SendReplyPack<Secs1Message>>,
    recv_blocks: &mut Vec<Secs1MessageBlock>,
  ) {
    let (retry, timeout_t2, is_master) = {
      let config = self.base.config();
      (config.retry, config.timeout_t2, config.is_master)
    };
    let blocks = pack.primary().to_blocks();
    let mut present: usize = 0;
    let mut count: u32 = 0;

    'attempt: while count <= retry {
      if self.base.is_closed() {
        pack.notify_failure(PackFailure::Terminated);
        return;
      }
      if let Err(error) = self.send_bytes(&[ENQ]) {
        pack.notify_failure(PackFailure::SendFailed(error.to_string()));
        return;
      }
      loop {
        match self.queue.poll_byte(timeout_t2) {
          None => {
            self.put_event(CircuitEvent::T2TimeoutWaitEot);
            count += 1;
            self.put_event(CircuitEvent::RetryCountUp { count });
            continue 'attempt;
          }
          Some(ENQ) if !is_master => {
            // Contention: the slave yields the line, receives, and starts
            // its own message over from the first block.
            self.receive_transfer(recv_blocks);
            count = 0;
            present = 0;
            continue 'attempt;
          }
          Some(EOT) => {
            match self.send_block(&blocks[present]) {
              Err(error) => {
                pack.notify_failure(PackFailure::SendFailed(error.to_string()));
                return;
              }
              Ok(true) => {
                if blocks[present].e_bit() {
                  pack.notify_sent();
                  return;
                }
                present += 1;
                count = 0;
                continue 'attempt;
              }
              Ok(false) => {
                count += 1;
                self.put_event(CircuitEvent::RetryCountUp { count });
                continue 'attempt;
              }
            }
          }
          // The master ignores a contending ENQ and keeps waiting for EOT.
          Some(_) => {}
        }
      }
    }
    pack.notify_failure(PackFailure::RetryOver);
  }

  /// One block over the line: frame bytes out, then T2 for ACK.
  fn send_block(&self, block: &Secs1MessageBlock) -> Result<bool, Secs1Error> {
    self.try_send_block_listeners.put(block.clone());
    self.send_bytes(block.to_bytes())?;
    let timeout_t2 = self.base.config().timeout_t2;
    match self.queue.poll_byte(timeout_t2) {
      Some(ACK) => {
        self.sent_block_listeners.put(block.clone());
        Ok(true)
      }
      None => {
        self.put_event(CircuitEvent::T2TimeoutWaitAck {
          block: block.clone(),
        });
        Ok(false)
      }
      Some(received) => {
        self.put_event(CircuitEvent::NotAck {
          block: block.clone(),
          received,
        });
        Ok(false)
      }
    }
  }

  /// The receiver role, entered on an incoming ENQ. Loops while the peer
  /// keeps the line for further blocks of the same message.
  fn receive_transfer(&self, recv_blocks: &mut Vec<Secs1MessageBlock>) {
    let (device_id, timeout_t1, timeout_t2, timeout_t4) = {
      let config = self.base.config();
      (
        config.device_id,
        config.timeout_t1,
        config.timeout_t2,
        config.timeout_t4,
      )
    };
    loop {
      if !self.send_control(EOT) {
        return;
      }

      let mut frame: Vec<u8> = vec![];
      if self.queue.put_to_buf(&mut frame, 1, timeout_t2).is_none() {
        self.send_control(NAK);
        self.put_event(CircuitEvent::T2TimeoutLengthByte);
        return;
      }
      let length = frame[0] as usize;
      if !(10..=254).contains(&length) {
        self.queue.garbage(timeout_t1);
        self.send_control(NAK);
        self.put_event(CircuitEvent::LengthByteError { length: frame[0] });
        return;
      }
      let target = 1 + length + 2;
      while frame.len() < target {
        if self
          .queue
          .put_to_buf(&mut frame, target, timeout_t1)
          .is_none()
        {
          self.send_control(NAK);
          self.put_event(CircuitEvent::T1Timeout {
            position: frame.len(),
          });
          return;
        }
      }

      if !sum_check_frame(&frame) {
        self.queue.garbage(timeout_t1);
        self.send_control(NAK);
        self.put_event(CircuitEvent::SumCheckError { bytes: frame });
        return;
      }
      if !self.send_control(ACK) {
        return;
      }

      let Some(block) = Secs1MessageBlock::from_bytes(frame) else {
        return;
      };
      self.recv_block_listeners.put(block.clone());

      if block.device_id() != device_id {
        self.put_event(CircuitEvent::DeviceIdMismatch {
          device_id: block.device_id(),
        });
        return;
      }

      let appended = match recv_blocks.last() {
        Some(previous) if previous.is_next_block(&block) => {
          recv_blocks.push(block.clone());
          true
        }
        // A retransmission we already acknowledged: drop it, keep the
        // buffer.
        Some(previous) if previous.is_same_block(&block) => false,
        Some(_) => {
          recv_blocks.clear();
          recv_blocks.push(block.clone());
          true
        }
        None => {
          recv_blocks.push(block.clone());
          true
        }
      };

      if appended && block.e_bit() {
        match Secs1Message::from_blocks(recv_blocks) {
          Ok(message) => {
            if !self.pool.receive(&message) {
              self.base.put_primary_msg(message.clone());
            }
            self.base.put_all_msg(message);
          }
          Err(error) => self.base.put_error(Secs1Error::Message(error)),
        }
        recv_blocks.clear();
        return;
      }

      if appended {
        // An intermediate block of a long reply extends its sender's T3.
        self.pool.timer_reset(block.system_bytes());
      }
      match self.queue.poll_byte(timeout_t4) {
        Some(ENQ) => continue,
        None => {
          self.put_event(CircuitEvent::T4Timeout { previous: block });
          return;
        }
        Some(received) => {
          self.put_event(CircuitEvent::NotEnqNextBlock {
            previous: block,
            received,
          });
          return;
        }
      }
    }
  }
}
