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

//! # SEMI EQUIPMENT COMMUNICATIONS STANDARD 1 (SECS-I) MESSAGE TRANSFER
//! **Based on:**
//! - **[SEMI E4]-0699**
//!
//! ---------------------------------------------------------------------------
//!
//! [SECS-I] is a byte-oriented, half-duplex block transfer protocol,
//! originally over RS-232C and here tunneled over TCP/IP. This crate
//! provides:
//!
//! - [SECS-I Message]s with their 10-byte headers and the block
//!   fragmentation and reassembly rules (244-byte payloads, block numbers,
//!   E-Bit, modulo-65536 checksum).
//! - The half-duplex [Circuit] with the ENQ/EOT/ACK/NAK handshake,
//!   master/slave contention resolution, the shared retry counter, and the
//!   T1/T2/T4 timings.
//! - TCP byte tunnels in connect-side and receiver-side variants, both
//!   implementing the [SECS Communicator] façade.
//!
//! [SEMI E4]: https://store-us.semi.org/products/e00400-semi-e4-specification-for-semi-equipment-communications-standard-1-message-transfer-secs-i
//! [SECS-I]:            crate
//! [SECS-I Message]:    Secs1Message
//! [Circuit]:           circuit
//! [SECS Communicator]: secs_core::SecsCommunicator

pub mod circuit;
pub mod message;
pub mod tcpip;

pub use circuit::CircuitEvent;
pub use message::{Secs1Message, Secs1MessageBlock, MAX_BLOCK_NUMBER, MAX_BLOCK_PAYLOAD};
pub use tcpip::{Secs1OnTcpIpCommunicator, Secs1OnTcpIpReceiverCommunicator};

use secs_core::{ConfigError, MessageError};
use secs_ii::sml::SmlError;
use thiserror::Error;

/// ## SECS-I ERROR
#[derive(Debug, Error)]
pub enum Secs1Error {
  /// A block of the primary message exhausted the retry budget.
  #[error("block send retry count exceeded")]
  RetryOver,

  /// The reply did not arrive within T3 of the primary (or of the last
  /// intermediate reply block).
  #[error("T3 reply timeout")]
  T3Timeout,

  /// No transport socket is registered to carry bytes.
  #[error("secs-i communicator not connected")]
  NotConnected,

  /// The communicator shut down while the transaction was open.
  #[error("communicator terminated")]
  Terminated,

  /// The communicator was closed; a closed communicator never reopens.
  #[error("communicator already closed")]
  AlreadyClosed,

  /// The communicate state was not reached within the timeout.
  #[error("communicate state wait timed out")]
  WaitCommunicatingTimeout,

  /// The transport refused outgoing bytes mid-transaction.
  #[error("send failed: {0}")]
  SendFailed(String),

  /// Message construction or body decoding failed.
  #[error(transparent)]
  Message(#[from] MessageError),

  /// SML parsing failed.
  #[error(transparent)]
  Sml(#[from] SmlError),

  /// Parameter settings out of range.
  #[error(transparent)]
  Config(#[from] ConfigError),

  /// TCP transport failure.
  #[error("transport failure: {0}")]
  Io(#[from] std::io::Error),
}
