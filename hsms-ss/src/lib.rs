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

//! # HIGH-SPEED SECS MESSAGE SERVICES, SINGLE SESSION (HSMS-SS)
//! **Based on:**
//! - **[SEMI E37]-1109**
//! - **[SEMI E37].1-0702**
//!
//! ---------------------------------------------------------------------------
//!
//! [HSMS-SS] restricts the HSMS protocol to a single host/equipment pair in
//! communication over one TCP/IP connection. This crate provides:
//!
//! - [HSMS Message]s with their header bits and control-message builders.
//! - The per-socket [Connection] engine: byte reader, T8-bounded frame
//!   reader, serialized sender, and send-reply correlation.
//! - The session state machine in two roles: the [Active Communicator]
//!   which connects and initiates the select procedure, and the
//!   [Passive Communicator] which accepts connections and responds to it.
//!
//! Both communicators implement the [SECS Communicator] façade, so
//! applications send primaries, reply, and register listeners without
//! caring which side of the link they are on.
//!
//! [SEMI E37]: https://store-us.semi.org/products/e03700-semi-e37-high-speed-secs-message-services-hsms-generic-services
//! [HSMS-SS]:              crate
//! [HSMS Message]:         HsmsMessage
//! [Connection]:           connection::HsmsConnection
//! [Active Communicator]:  HsmsSsActiveCommunicator
//! [Passive Communicator]: HsmsSsPassiveCommunicator
//! [SECS Communicator]:    secs_core::SecsCommunicator

pub mod active;
mod communicator;
pub mod connection;
pub mod message;
pub mod passive;

pub use active::HsmsSsActiveCommunicator;
pub use communicator::HsmsCommunicateState;
pub use message::{ControlType, HsmsMessage, RejectReason, SelectStatus};
pub use passive::HsmsSsPassiveCommunicator;

use secs_core::{ConfigError, MessageError};
use secs_ii::sml::SmlError;
use thiserror::Error;

/// ## HSMS ERROR
#[derive(Debug, Error)]
pub enum HsmsError {
  /// The reply to a data message did not arrive within T3. The connection
  /// stays up.
  #[error("T3 reply timeout")]
  T3Timeout,

  /// The response to a control transaction did not arrive within T6. The
  /// connection is shut down.
  #[error("T6 control transaction timeout")]
  T6Timeout,

  /// A gap between bytes of one frame exceeded T8. The connection is shut
  /// down.
  #[error("T8 network intercharacter timeout")]
  T8Timeout,

  /// The frame length field is below the 10-byte header size.
  #[error("frame length {length} below the 10-byte header")]
  MalformedFrame { length: usize },

  /// The remote entity answered the transaction with REJECT.REQ.
  #[error("message rejected by the remote entity")]
  Rejected { reason: Option<RejectReason> },

  /// The passive entity answered SELECT.REQ with a failure status.
  #[error("select failed with status 0x{status:02X}")]
  SelectFailed { status: u8 },

  /// No selected session exists to send through.
  #[error("hsms-ss communicator not connected")]
  NotConnected,

  /// The connection shut down while the transaction was open.
  #[error("connection terminated")]
  Terminated,

  /// The communicator was closed; a closed communicator never reopens.
  #[error("communicator already closed")]
  AlreadyClosed,

  /// The communicate state was not reached within the timeout.
  #[error("communicate state wait timed out")]
  WaitCommunicatingTimeout,

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
