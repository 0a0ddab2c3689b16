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

//! # SECS COMMUNICATION CORE
//!
//! The pieces shared by every SECS session protocol, below the protocol
//! engines and above the [SECS-II] item codec:
//!
//! - The [SECS Message] trait over the common header fields (stream,
//!   function, W-Bit, system bytes).
//! - [Concurrent Queuing]: the callback, waiting, and byte-accumulating
//!   queues the protocol loops are built from.
//! - [Send-Reply Correlation]: the pack pool mapping system bytes to the
//!   thread waiting for a reply.
//! - The [SECS Communicator] façade trait and the [Communicator Base] every
//!   concrete communicator embeds.
//! - [Parameter Settings] recognized by all communicators.
//!
//! [SECS-II]:                secs_ii
//! [SECS Message]:           SecsMessage
//! [Concurrent Queuing]:     queuing
//! [Send-Reply Correlation]: pool
//! [SECS Communicator]:      SecsCommunicator
//! [Communicator Base]:      CommunicatorBase
//! [Parameter Settings]:     CommunicatorConfig

pub mod communicator;
pub mod pool;
pub mod queuing;

pub use communicator::{
  CommunicateWaitError, CommunicatorBase, LifecycleError, SecsCommunicator,
};

use secs_ii::{Item, ItemError};
use std::time::Duration;
use thiserror::Error;

/// ## BOXED ERROR
///
/// The type carried by error listeners; every protocol error converts into
/// it.
pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// ## MESSAGE CONSTRUCTION ERROR
#[derive(Clone, Debug, PartialEq, Error)]
pub enum MessageError {
  /// Stream numbers occupy 7 bits.
  #[error("stream {0} is out of range 0..=127")]
  StreamRange(u8),

  /// Device and session ids occupy 15 bits.
  #[error("device id {0} is out of range 0..=32767")]
  DeviceIdRange(u16),

  /// A SECS-I message body would span more than 32,767 blocks.
  #[error("message body spans more than 32767 blocks")]
  BlockOverflow,

  /// Reassembly was attempted from an empty block sequence.
  #[error("no blocks to reassemble")]
  EmptyBlocks,

  /// The message body failed to encode or decode.
  #[error(transparent)]
  Item(#[from] ItemError),
}

/// ## SECS MESSAGE
/// **Based on SEMI E5§6**
///
/// The fields common to every message regardless of the session protocol
/// that carries it. The 10-byte header layout differs between protocols;
/// each exposes it through [Header Bytes].
///
/// [Header Bytes]: SecsMessage::header10
pub trait SecsMessage: Clone + Send + Sync + 'static {
  /// ### STREAM
  ///
  /// 0 to 127, 7 bits.
  fn stream(&self) -> u8;

  /// ### FUNCTION
  ///
  /// 0 to 255, 8 bits.
  fn function(&self) -> u8;

  /// ### W-BIT
  ///
  /// Reply-expected flag of a primary message.
  fn w_bit(&self) -> bool;

  /// ### MESSAGE BODY
  fn body(&self) -> Option<&Item>;

  /// ### SYSTEM BYTES
  ///
  /// The 4-byte transaction id minted by the initiator.
  fn system_bytes(&self) -> [u8; 4];

  /// ### DEVICE ID
  ///
  /// The device id (SECS-I) or session id (HSMS) of the message.
  fn device_id(&self) -> u16;

  /// ### HEADER BYTES
  fn header10(&self) -> [u8; 10];

  /// ### HEADER BYTES, PRINTABLE
  fn header10_str(&self) -> String {
    let h = self.header10();
    format!(
      "[{:02X} {:02X}|{:02X} {:02X}|{:02X} {:02X}|{:02X} {:02X} {:02X} {:02X}]",
      h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8], h[9]
    )
  }
}

/// ## GEM CLOCK FORMAT
///
/// The two ASCII clock forms of the S2F18/S2F31 time item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockType {
  /// `yymmddhhmmss`, 12 characters.
  A12,
  /// `yyyymmddhhmmsscc`, 16 characters.
  A16,
}

/// ## CONFIGURATION ERROR
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ConfigError {
  /// Timeouts must be greater than zero.
  #[error("{name} must be greater than zero")]
  NonPositiveTimeout { name: &'static str },

  /// Device and session ids occupy 15 bits.
  #[error("device id {0} is out of range 0..=32767")]
  DeviceIdRange(u16),
}

/// ## PARAMETER SETTINGS
///
/// The options recognized by every communicator. Socket addresses, ports,
/// and baud rates belong to the concrete communicator constructors.
#[derive(Clone, Debug)]
pub struct CommunicatorConfig {
  /// ### DEVICE ID
  ///
  /// The device id (SECS-I) or session id (HSMS-SS) of this endpoint,
  /// 0 to 32767.
  pub device_id: u16,

  /// ### IS EQUIPMENT
  ///
  /// Equipment mints system bytes carrying the device id in the high half;
  /// hosts mint with a zero high half.
  pub is_equip: bool,

  /// ### IS MASTER
  ///
  /// SECS-I only: the master keeps the line on ENQ-vs-ENQ contention, the
  /// slave yields. Conventionally the host is the master.
  pub is_master: bool,

  /// ### COMMUNICATOR NAME
  pub name: Option<String>,

  /// ### T1, INTER-CHARACTER TIMEOUT (SECS-I)
  pub timeout_t1: Duration,

  /// ### T2, PROTOCOL TIMEOUT (SECS-I)
  pub timeout_t2: Duration,

  /// ### T3, REPLY TIMEOUT
  pub timeout_t3: Duration,

  /// ### T4, INTER-BLOCK TIMEOUT (SECS-I)
  pub timeout_t4: Duration,

  /// ### T5, CONNECT SEPARATION TIMEOUT (HSMS ACTIVE)
  pub timeout_t5: Duration,

  /// ### T6, CONTROL TRANSACTION TIMEOUT (HSMS)
  pub timeout_t6: Duration,

  /// ### T7, NOT-SELECTED TIMEOUT (HSMS PASSIVE)
  pub timeout_t7: Duration,

  /// ### T8, NETWORK INTER-CHARACTER TIMEOUT (HSMS)
  pub timeout_t8: Duration,

  /// ### REBIND / RECONNECT SEPARATION
  ///
  /// How long a passive endpoint waits before rebinding its listen socket,
  /// and a SECS-I-on-TCP/IP connect-side endpoint before reconnecting.
  pub timeout_rebind: Duration,

  /// ### SECS-I BLOCK RETRY LIMIT
  pub retry: u32,

  /// ### GEM MDLN
  pub gem_mdln: String,

  /// ### GEM SOFTREV
  pub gem_softrev: String,

  /// ### GEM CLOCK TYPE
  pub gem_clock_type: ClockType,
}

impl CommunicatorConfig {
  /// ### NEW PARAMETER SETTINGS
  ///
  /// All timeouts at their SEMI defaults: T1 = 0.5s, T2 = 10s, T3 = 45s,
  /// T4 = 45s, T5 = 10s, T6 = 5s, T7 = 10s, T8 = 5s, rebind = 5s,
  /// retry = 3.
  pub fn new(device_id: u16, is_equip: bool) -> Self {
    CommunicatorConfig {
      device_id,
      is_equip,
      is_master: !is_equip,
      name: None,
      timeout_t1: Duration::from_millis(500),
      timeout_t2: Duration::from_secs(10),
      timeout_t3: Duration::from_secs(45),
      timeout_t4: Duration::from_secs(45),
      timeout_t5: Duration::from_secs(10),
      timeout_t6: Duration::from_secs(5),
      timeout_t7: Duration::from_secs(10),
      timeout_t8: Duration::from_secs(5),
      timeout_rebind: Duration::from_secs(5),
      retry: 3,
      gem_mdln: "      ".to_string(),
      gem_softrev: "      ".to_string(),
      gem_clock_type: ClockType::A16,
    }
  }

  /// ### VALIDATE
  ///
  /// Checks the ranges a communicator constructor requires: all timeouts
  /// greater than zero and the device id within 15 bits.
  pub fn validate(&self) -> Result<(), ConfigError> {
    for (name, value) in [
      ("timeout_t1", self.timeout_t1),
      ("timeout_t2", self.timeout_t2),
      ("timeout_t3", self.timeout_t3),
      ("timeout_t4", self.timeout_t4),
      ("timeout_t5", self.timeout_t5),
      ("timeout_t6", self.timeout_t6),
      ("timeout_t7", self.timeout_t7),
      ("timeout_t8", self.timeout_t8),
      ("timeout_rebind", self.timeout_rebind),
    ] {
      if value.is_zero() {
        return Err(ConfigError::NonPositiveTimeout { name });
      }
    }
    if self.device_id > 0x7FFF {
      return Err(ConfigError::DeviceIdRange(self.device_id));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn config_defaults_validate() {
    assert!(CommunicatorConfig::new(10, true).validate().is_ok());
  }

  #[test]
  fn config_rejects_zero_timeouts_and_wide_device_ids() {
    let mut config = CommunicatorConfig::new(10, true);
    config.timeout_t3 = Duration::ZERO;
    assert_eq!(
      config.validate(),
      Err(ConfigError::NonPositiveTimeout { name: "timeout_t3" })
    );

    let mut config = CommunicatorConfig::new(0x8000, false);
    config.device_id = 0x8000;
    assert_eq!(config.validate(), Err(ConfigError::DeviceIdRange(0x8000)));
  }
}
