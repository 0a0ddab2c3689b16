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

//! # HSMS MESSAGE
//! **Based on SEMI E37-1109§8.2**
//!
//! An HSMS message is a 10-byte header and an optional SECS-II body, framed
//! on the wire by a 4-byte big-endian length covering the header and body.
//!
//! Header layout:
//!
//! | Bytes | Field |
//! |-------|-------|
//! | 0-1   | Session ID (high bit reserved) |
//! | 2     | Stream, with the W-Bit in the high bit |
//! | 3     | Function |
//! | 4     | P-Type (0 = SECS-II) |
//! | 5     | S-Type (0 = data, 1..9 = control) |
//! | 6-9   | System Bytes |
//!
//! Control messages carry no body; SELECT.RSP and REJECT.REQ carry their
//! status and reason codes in header byte 3.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use secs_core::{MessageError, SecsMessage};
use secs_ii::Item;
use std::fmt;
use std::sync::OnceLock;

/// ## CONTROL TYPE
/// **Based on SEMI E37-1109§8.3.21**
///
/// The (P-Type, S-Type) classification of an HSMS message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlType {
  /// P-Type 0, S-Type 0: a SECS-II data message.
  Data,
  SelectReq,
  SelectRsp,
  DeselectReq,
  DeselectRsp,
  LinktestReq,
  LinktestRsp,
  RejectReq,
  SeparateReq,
  /// Any (P-Type, S-Type) pair the protocol does not define.
  Undefined { p_type: u8, s_type: u8 },
}

impl ControlType {
  /// ### FROM HEADER BYTES
  pub fn from_header(p_type: u8, s_type: u8) -> ControlType {
    match (p_type, s_type) {
      (0, 0) => ControlType::Data,
      (0, 1) => ControlType::SelectReq,
      (0, 2) => ControlType::SelectRsp,
      (0, 3) => ControlType::DeselectReq,
      (0, 4) => ControlType::DeselectRsp,
      (0, 5) => ControlType::LinktestReq,
      (0, 6) => ControlType::LinktestRsp,
      (0, 7) => ControlType::RejectReq,
      (0, 9) => ControlType::SeparateReq,
      (p_type, s_type) => ControlType::Undefined { p_type, s_type },
    }
  }

  /// ### KNOWN S-TYPE
  ///
  /// Whether the S-Type value alone is one the protocol defines. Used to
  /// choose between NOT-SUPPORT-TYPE-S and NOT-SUPPORT-TYPE-P when
  /// rejecting an [Undefined] message.
  ///
  /// [Undefined]: ControlType::Undefined
  pub fn known_s_type(s_type: u8) -> bool {
    matches!(s_type, 0..=7 | 9)
  }
}

/// ## SELECT STATUS
/// **Based on SEMI E37-1109§8.3.21.2**
///
/// Header byte 3 of a SELECT.RSP.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum SelectStatus {
  Success = 0x00,
  AlreadyActive = 0x01,
  NotReady = 0x02,
  AlreadyUsed = 0x03,
}

/// ## REJECT REASON
/// **Based on SEMI E37-1109§8.3.21.4**
///
/// Header byte 3 of a REJECT.REQ.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum RejectReason {
  NotSupportTypeS = 0x01,
  NotSupportTypeP = 0x02,
  TransactionNotOpen = 0x03,
  NotSelected = 0x04,
}

/// ## HSMS MESSAGE
///
/// Immutable after construction; the framed wire form is computed once and
/// memoized. The body is encoded at construction time so that a malformed
/// body is a construction error, not a send error.
#[derive(Clone, Debug)]
pub struct HsmsMessage {
  header: [u8; 10],
  body: Option<Item>,
  body_bytes: Vec<u8>,
  cache_bytes: OnceLock<Vec<u8>>,
}

impl PartialEq for HsmsMessage {
  fn eq(&self, other: &Self) -> bool {
    self.header == other.header && self.body == other.body
  }
}

/// ## CONSTRUCTORS
impl HsmsMessage {
  fn from_parts(header: [u8; 10], body: Option<Item>) -> Result<Self, MessageError> {
    let body_bytes = match &body {
      Some(item) => item.to_bytes()?,
      None => vec![],
    };
    Ok(HsmsMessage {
      header,
      body,
      body_bytes,
      cache_bytes: OnceLock::new(),
    })
  }

  /// ### DATA MESSAGE
  pub fn data(
    session_id: u16,
    stream: u8,
    function: u8,
    w_bit: bool,
    body: Option<Item>,
    system_bytes: [u8; 4],
  ) -> Result<Self, MessageError> {
    if stream > 0x7F {
      return Err(MessageError::StreamRange(stream));
    }
    if session_id > 0x7FFF {
      return Err(MessageError::DeviceIdRange(session_id));
    }
    let mut byte_2 = stream;
    if w_bit {
      byte_2 |= 0x80;
    }
    Self::from_parts(
      [
        (session_id >> 8) as u8,
        (session_id & 0xFF) as u8,
        byte_2,
        function,
        0x00,
        0x00,
        system_bytes[0],
        system_bytes[1],
        system_bytes[2],
        system_bytes[3],
      ],
      body,
    )
  }

  fn control(byte_2: u8, byte_3: u8, s_type: u8, system_bytes: [u8; 4]) -> Self {
    HsmsMessage {
      header: [
        0xFF,
        0xFF,
        byte_2,
        byte_3,
        0x00,
        s_type,
        system_bytes[0],
        system_bytes[1],
        system_bytes[2],
        system_bytes[3],
      ],
      body: None,
      body_bytes: vec![],
      cache_bytes: OnceLock::new(),
    }
  }

  /// ### SELECT.REQ
  pub fn select_req(system_bytes: [u8; 4]) -> Self {
    Self::control(0x00, 0x00, 0x01, system_bytes)
  }

  /// ### SELECT.RSP
  ///
  /// Copies the system bytes of the request; the status goes into header
  /// byte 3.
  pub fn select_rsp(primary: &HsmsMessage, status: SelectStatus) -> Self {
    Self::control(0x00, status.into(), 0x02, primary.system_bytes())
  }

  /// ### LINKTEST.REQ
  pub fn linktest_req(system_bytes: [u8; 4]) -> Self {
    Self::control(0x00, 0x00, 0x05, system_bytes)
  }

  /// ### LINKTEST.RSP
  pub fn linktest_rsp(primary: &HsmsMessage) -> Self {
    Self::control(0x00, 0x00, 0x06, primary.system_bytes())
  }

  /// ### REJECT.REQ
  ///
  /// Header byte 2 echoes the offending message's P-Type when the reason is
  /// NOT-SUPPORT-TYPE-P, and its S-Type otherwise.
  pub fn reject_req(primary: &HsmsMessage, reason: RejectReason) -> Self {
    let primary_header = primary.header10();
    let byte_2 = if reason == RejectReason::NotSupportTypeP {
      primary_header[4]
    } else {
      primary_header[5]
    };
    Self::control(byte_2, reason.into(), 0x07, primary.system_bytes())
  }

  /// ### SEPARATE.REQ
  pub fn separate_req(system_bytes: [u8; 4]) -> Self {
    Self::control(0x00, 0x00, 0x09, system_bytes)
  }
}

/// ## INSPECTION
impl HsmsMessage {
  /// ### SESSION ID
  pub fn session_id(&self) -> u16 {
    (u16::from(self.header[0] & 0x7F) << 8) | u16::from(self.header[1])
  }

  /// ### P-TYPE
  pub fn p_type(&self) -> u8 {
    self.header[4]
  }

  /// ### S-TYPE
  pub fn s_type(&self) -> u8 {
    self.header[5]
  }

  /// ### CONTROL TYPE
  pub fn control_type(&self) -> ControlType {
    ControlType::from_header(self.p_type(), self.s_type())
  }

  /// ### SELECT STATUS
  ///
  /// Header byte 3 of a SELECT.RSP, when it names a defined status.
  pub fn select_status(&self) -> Option<SelectStatus> {
    SelectStatus::try_from(self.header[3]).ok()
  }

  /// ### REJECT REASON
  ///
  /// Header byte 3 of a REJECT.REQ, when it names a defined reason.
  pub fn reject_reason(&self) -> Option<RejectReason> {
    RejectReason::try_from(self.header[3]).ok()
  }
}

/// ## WIRE CODEC
impl HsmsMessage {
  /// ### MESSAGE -> FRAME BYTES
  ///
  /// The framed wire form: 4-byte big-endian length covering the 10-byte
  /// header and the body, then the header, then the body. Memoized.
  pub fn to_bytes(&self) -> &[u8] {
    self.cache_bytes.get_or_init(|| {
      let length = (10 + self.body_bytes.len()) as u32;
      let mut vec: Vec<u8> = Vec::with_capacity(4 + length as usize);
      vec.extend_from_slice(&length.to_be_bytes());
      vec.extend_from_slice(&self.header);
      vec.extend_from_slice(&self.body_bytes);
      vec
    })
  }

  /// ### FRAME BYTES -> MESSAGE
  ///
  /// Decodes a complete frame (length, header, body). Control messages
  /// carry no body; a data message's body must decode as exactly one item.
  pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
    if bytes.len() < 14 {
      return Err(MessageError::Item(secs_ii::ItemError::Truncated));
    }
    let mut header = [0u8; 10];
    header.copy_from_slice(&bytes[4..14]);
    let control_type = ControlType::from_header(header[4], header[5]);
    let body = if control_type == ControlType::Data && bytes.len() > 14 {
      Some(Item::from_body_bytes(&bytes[14..])?)
    } else {
      None
    };
    let message = Self::from_parts(header, body)?;
    let _ = message.cache_bytes.set(bytes.to_vec());
    Ok(message)
  }
}

impl SecsMessage for HsmsMessage {
  fn stream(&self) -> u8 {
    self.header[2] & 0x7F
  }

  fn function(&self) -> u8 {
    self.header[3]
  }

  fn w_bit(&self) -> bool {
    self.header[2] & 0x80 == 0x80
  }

  fn body(&self) -> Option<&Item> {
    self.body.as_ref()
  }

  fn system_bytes(&self) -> [u8; 4] {
    [self.header[6], self.header[7], self.header[8], self.header[9]]
  }

  fn device_id(&self) -> u16 {
    self.session_id()
  }

  fn header10(&self) -> [u8; 10] {
    self.header
  }
}

impl fmt::Display for HsmsMessage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} length:{}", self.header10_str(), 10 + self.body_bytes.len())?;
    if self.control_type() == ControlType::Data {
      write!(f, "\nS{}F{}", self.stream(), self.function())?;
      if self.w_bit() {
        write!(f, " W")?;
      }
      if let Some(body) = &self.body {
        write!(f, "\n{}", body.to_sml())?;
      }
      write!(f, ".")?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn data_message_header_bits() {
    let msg = HsmsMessage::data(10, 1, 1, true, None, [0, 0, 0, 9]).unwrap();
    assert_eq!(msg.session_id(), 10);
    assert_eq!(msg.stream(), 1);
    assert_eq!(msg.function(), 1);
    assert!(msg.w_bit());
    assert_eq!(msg.control_type(), ControlType::Data);
    assert_eq!(msg.system_bytes(), [0, 0, 0, 9]);
    assert_eq!(msg.to_bytes(), &[0, 0, 0, 10, 0, 10, 0x81, 1, 0, 0, 0, 0, 0, 9]);
  }

  #[test]
  fn stream_range_is_a_construction_error() {
    assert_eq!(
      HsmsMessage::data(10, 128, 1, false, None, [0; 4]).unwrap_err(),
      MessageError::StreamRange(128)
    );
    assert_eq!(
      HsmsMessage::data(0x8000, 1, 1, false, None, [0; 4]).unwrap_err(),
      MessageError::DeviceIdRange(0x8000)
    );
  }

  #[test]
  fn frame_round_trip_with_body() {
    let body = Item::List(vec![
      Item::ascii("MDLN-A").unwrap(),
      Item::ascii("000001").unwrap(),
    ]);
    let msg = HsmsMessage::data(10, 1, 2, false, Some(body), [0, 0, 1, 1]).unwrap();
    let decoded = HsmsMessage::from_bytes(msg.to_bytes()).unwrap();
    assert_eq!(decoded, msg);
    let length = u32::from_be_bytes(msg.to_bytes()[0..4].try_into().unwrap()) as usize;
    assert_eq!(length, msg.to_bytes().len() - 4);
  }

  #[test]
  fn select_rsp_copies_system_bytes_and_carries_status() {
    let req = HsmsMessage::select_req([1, 2, 3, 4]);
    let rsp = HsmsMessage::select_rsp(&req, SelectStatus::AlreadyUsed);
    assert_eq!(rsp.control_type(), ControlType::SelectRsp);
    assert_eq!(rsp.system_bytes(), [1, 2, 3, 4]);
    assert_eq!(rsp.select_status(), Some(SelectStatus::AlreadyUsed));
  }

  #[test]
  fn reject_req_echoes_the_offending_type_byte() {
    let data = HsmsMessage::data(10, 5, 1, true, None, [9, 9, 9, 9]).unwrap();
    let reject = HsmsMessage::reject_req(&data, RejectReason::NotSelected);
    assert_eq!(reject.control_type(), ControlType::RejectReq);
    assert_eq!(reject.reject_reason(), Some(RejectReason::NotSelected));
    assert_eq!(reject.system_bytes(), [9, 9, 9, 9]);
    // Reason 4 echoes the S-Type byte.
    assert_eq!(reject.header10()[2], 0x00);

    let odd = HsmsMessage::from_bytes(&[0, 0, 0, 10, 0xFF, 0xFF, 0, 0, 1, 0, 0, 0, 0, 7]).unwrap();
    let reject_p = HsmsMessage::reject_req(&odd, RejectReason::NotSupportTypeP);
    // Reason 2 echoes the P-Type byte.
    assert_eq!(reject_p.header10()[2], 1);
  }

  #[test]
  fn control_messages_have_no_body() {
    let linktest = HsmsMessage::linktest_req([0, 0, 0, 1]);
    assert_eq!(linktest.to_bytes().len(), 14);
    assert_eq!(linktest.control_type(), ControlType::LinktestReq);
    let rsp = HsmsMessage::linktest_rsp(&linktest);
    assert_eq!(rsp.system_bytes(), linktest.system_bytes());
    assert_eq!(rsp.control_type(), ControlType::LinktestRsp);
  }

  #[test]
  fn undefined_s_type_is_classified() {
    let msg = HsmsMessage::from_bytes(&[0, 0, 0, 10, 0xFF, 0xFF, 0, 0, 0, 8, 0, 0, 0, 1]).unwrap();
    assert_eq!(
      msg.control_type(),
      ControlType::Undefined { p_type: 0, s_type: 8 }
    );
    assert!(!ControlType::known_s_type(8));
    assert!(ControlType::known_s_type(5));
  }
}
