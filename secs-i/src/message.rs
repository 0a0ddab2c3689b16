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

//! # SECS-I MESSAGE AND BLOCKS
//! **Based on SEMI E4§7-8**
//!
//! A SECS-I message is a 10-byte header and an optional SECS-II body, split
//! into blocks of at most 244 payload bytes. One block is framed on the
//! wire as:
//!
//! ```text
//! [length byte = 10 + payload] [10-byte header] [payload] [u16 checksum]
//! ```
//!
//! Header layout:
//!
//! | Bytes | Field |
//! |-------|-------|
//! | 0-1   | Device ID, with the R-Bit in the high bit |
//! | 2     | Stream, with the W-Bit in the high bit |
//! | 3     | Function |
//! | 4-5   | Block number, with the E-Bit in the high bit |
//! | 6-9   | System Bytes |
//!
//! Block numbers start at 1 and increment per block; the E-Bit marks the
//! last block. The checksum is the 16-bit modulo sum of the header and
//! payload bytes.

use secs_core::{MessageError, SecsMessage};
use secs_ii::Item;
use std::fmt;
use std::sync::OnceLock;

/// Maximum payload bytes carried by one block.
pub const MAX_BLOCK_PAYLOAD: usize = 244;

/// Maximum block number; the high bit of the field is the E-Bit.
pub const MAX_BLOCK_NUMBER: usize = 0x7FFF;

/// ## SECS-I MESSAGE BLOCK
///
/// One framed block, including the leading length byte and the trailing
/// checksum.
#[derive(Clone, Debug, PartialEq)]
pub struct Secs1MessageBlock {
  bytes: Vec<u8>,
}

impl Secs1MessageBlock {
  /// ### FROM FRAME BYTES
  ///
  /// Wraps framed bytes, checking only structural consistency: the length
  /// byte within [10, 254] and the buffer sized `1 + length + 2`. The
  /// checksum is verified separately by [Sum Check], since the circuit
  /// must NAK rather than fail on a corrupted block.
  ///
  /// [Sum Check]: Secs1MessageBlock::sum_check
  pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
    let length = *bytes.first()? as usize;
    if !(10..=254).contains(&length) || bytes.len() != 1 + length + 2 {
      return None;
    }
    Some(Secs1MessageBlock { bytes })
  }

  /// ### FRAME BYTES
  pub fn to_bytes(&self) -> &[u8] {
    &self.bytes
  }

  /// ### LENGTH BYTE
  pub fn length_byte(&self) -> u8 {
    self.bytes[0]
  }

  /// ### PAYLOAD
  pub fn payload(&self) -> &[u8] {
    &self.bytes[11..self.bytes.len() - 2]
  }

  /// ### DEVICE ID
  pub fn device_id(&self) -> u16 {
    (u16::from(self.bytes[1] & 0x7F) << 8) | u16::from(self.bytes[2])
  }

  /// ### R-BIT
  pub fn r_bit(&self) -> bool {
    self.bytes[1] & 0x80 == 0x80
  }

  /// ### STREAM
  pub fn stream(&self) -> u8 {
    self.bytes[3] & 0x7F
  }

  /// ### W-BIT
  pub fn w_bit(&self) -> bool {
    self.bytes[3] & 0x80 == 0x80
  }

  /// ### FUNCTION
  pub fn function(&self) -> u8 {
    self.bytes[4]
  }

  /// ### E-BIT
  pub fn e_bit(&self) -> bool {
    self.bytes[5] & 0x80 == 0x80
  }

  /// ### BLOCK NUMBER
  pub fn block_number(&self) -> u16 {
    (u16::from(self.bytes[5] & 0x7F) << 8) | u16::from(self.bytes[6])
  }

  /// ### SYSTEM BYTES
  pub fn system_bytes(&self) -> [u8; 4] {
    [self.bytes[7], self.bytes[8], self.bytes[9], self.bytes[10]]
  }

  /// ### SUM CHECK
  ///
  /// The 16-bit modulo sum of header and payload against the trailing
  /// checksum bytes.
  pub fn sum_check(&self) -> bool {
    sum_check_frame(&self.bytes)
  }

  /// ### CONTINUITY CHECK
  ///
  /// Whether `block` continues this one: identical device, stream,
  /// function, and system bytes, with the block number incremented by one.
  pub fn is_next_block(&self, block: &Secs1MessageBlock) -> bool {
    let a = &self.bytes;
    let b = &block.bytes;
    a[1] == b[1]
      && a[2] == b[2]
      && a[3] == b[3]
      && a[4] == b[4]
      && a[7] == b[7]
      && a[8] == b[8]
      && a[9] == b[9]
      && a[10] == b[10]
      && block.block_number() == self.block_number().wrapping_add(1)
  }

  /// ### DUPLICATE CHECK
  ///
  /// Whether `block` is a retransmission of this one: the continuity
  /// fields plus an identical block-number field.
  pub fn is_same_block(&self, block: &Secs1MessageBlock) -> bool {
    let a = &self.bytes;
    let b = &block.bytes;
    a[1] == b[1]
      && a[2] == b[2]
      && a[3] == b[3]
      && a[4] == b[4]
      && a[5] == b[5]
      && a[6] == b[6]
      && a[7] == b[7]
      && a[8] == b[8]
      && a[9] == b[9]
      && a[10] == b[10]
  }
}

/// The 16-bit modulo sum of everything between the length byte and the
/// checksum, compared to the trailing two bytes.
pub(crate) fn sum_check_frame(frame: &[u8]) -> bool {
  let end = frame.len() - 2;
  let sum: u16 = frame[1..end]
    .iter()
    .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)));
  let declared = (u16::from(frame[end]) << 8) | u16::from(frame[end + 1]);
  sum == declared
}

impl fmt::Display for Secs1MessageBlock {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let b = &self.bytes;
    write!(
      f,
      "[{:02X} {:02X}|{:02X} {:02X}|{:02X} {:02X}|{:02X} {:02X} {:02X} {:02X}] length: {}",
      b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[0]
    )
  }
}

/// ## SECS-I MESSAGE
///
/// Immutable after construction; the block split is computed once and
/// memoized. The body is encoded and the block count validated at
/// construction, so fragmentation itself cannot fail.
#[derive(Clone, Debug)]
pub struct Secs1Message {
  header: [u8; 10],
  body: Option<Item>,
  body_bytes: Vec<u8>,
  cache_blocks: OnceLock<Vec<Secs1MessageBlock>>,
}

impl PartialEq for Secs1Message {
  fn eq(&self, other: &Self) -> bool {
    self.header == other.header && self.body == other.body
  }
}

impl Secs1Message {
  /// ### NEW MESSAGE
  ///
  /// The R-Bit conventionally marks messages sent by the equipment.
  pub fn new(
    stream: u8,
    function: u8,
    w_bit: bool,
    body: Option<Item>,
    system_bytes: [u8; 4],
    device_id: u16,
    r_bit: bool,
  ) -> Result<Self, MessageError> {
    if stream > 0x7F {
      return Err(MessageError::StreamRange(stream));
    }
    if device_id > 0x7FFF {
      return Err(MessageError::DeviceIdRange(device_id));
    }
    let body_bytes = match &body {
      Some(item) => item.to_bytes()?,
      None => vec![],
    };
    if body_bytes.len() > MAX_BLOCK_PAYLOAD * MAX_BLOCK_NUMBER {
      return Err(MessageError::BlockOverflow);
    }
    let mut byte_0 = (device_id >> 8) as u8;
    if r_bit {
      byte_0 |= 0x80;
    }
    let mut byte_2 = stream;
    if w_bit {
      byte_2 |= 0x80;
    }
    Ok(Secs1Message {
      header: [
        byte_0,
        (device_id & 0xFF) as u8,
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
      body_bytes,
      cache_blocks: OnceLock::new(),
    })
  }

  /// ### R-BIT
  pub fn r_bit(&self) -> bool {
    self.header[0] & 0x80 == 0x80
  }

  /// ### MESSAGE -> BLOCKS
  ///
  /// Splits the body into framed blocks of at most 244 payload bytes,
  /// numbering from 1, with the E-Bit on the last. Computed once and
  /// memoized.
  pub fn to_blocks(&self) -> &[Secs1MessageBlock] {
    self.cache_blocks.get_or_init(|| {
      let mut blocks: Vec<Secs1MessageBlock> = vec![];
      let mut position: usize = 0;
      let mut block_number: u16 = 0;
      loop {
        block_number += 1;
        let remaining = self.body_bytes.len() - position;
        let take = remaining.min(MAX_BLOCK_PAYLOAD);
        let e_bit = remaining == take;
        let payload = &self.body_bytes[position..position + take];

        let mut byte_4 = (block_number >> 8) as u8;
        if e_bit {
          byte_4 |= 0x80;
        }
        let mut frame: Vec<u8> = Vec::with_capacity(1 + 10 + take + 2);
        frame.push((take + 10) as u8);
        frame.extend_from_slice(&self.header[0..4]);
        frame.push(byte_4);
        frame.push((block_number & 0xFF) as u8);
        frame.extend_from_slice(&self.header[6..10]);
        frame.extend_from_slice(payload);
        let sum: u16 = frame[1..]
          .iter()
          .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)));
        frame.extend_from_slice(&sum.to_be_bytes());

        blocks.push(Secs1MessageBlock { bytes: frame });

        if e_bit {
          break;
        }
        position += take;
      }
      blocks
    })
  }

  /// ### BLOCKS -> MESSAGE
  ///
  /// Concatenates the payloads of a continuous block sequence and decodes
  /// the body. The header fields come from the first block.
  pub fn from_blocks(blocks: &[Secs1MessageBlock]) -> Result<Self, MessageError> {
    let first = blocks.first().ok_or(MessageError::EmptyBlocks)?;
    let mut body_bytes: Vec<u8> = vec![];
    for block in blocks {
      body_bytes.extend_from_slice(block.payload());
    }
    let body = if body_bytes.is_empty() {
      None
    } else {
      Some(Item::from_body_bytes(&body_bytes)?)
    };
    Self::new(
      first.stream(),
      first.function(),
      first.w_bit(),
      body,
      first.system_bytes(),
      first.device_id(),
      first.r_bit(),
    )
  }
}

impl SecsMessage for Secs1Message {
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
    (u16::from(self.header[0] & 0x7F) << 8) | u16::from(self.header[1])
  }

  fn header10(&self) -> [u8; 10] {
    self.header
  }
}

impl fmt::Display for Secs1Message {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}\nS{}F{}", self.header10_str(), self.stream(), self.function())?;
    if self.w_bit() {
      write!(f, " W")?;
    }
    if let Some(body) = &self.body {
      write!(f, "\n{}", body.to_sml())?;
    }
    write!(f, ".")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn message(body: Option<Item>) -> Secs1Message {
    Secs1Message::new(6, 3, true, body, [0, 10, 0, 1], 10, false).unwrap()
  }

  fn wide_body() -> Item {
    // 2 + 9 * (2 + 40) = 380 body bytes: exactly two blocks.
    Item::List(
      (0..9)
        .map(|i| Item::U4((0..10).map(|j| i * 100 + j).collect()))
        .collect(),
    )
  }

  #[test]
  fn header_only_message_is_one_empty_block() {
    let msg = message(None);
    let blocks = msg.to_blocks();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].length_byte(), 10);
    assert!(blocks[0].e_bit());
    assert_eq!(blocks[0].block_number(), 1);
    assert!(blocks[0].sum_check());
  }

  #[test]
  fn two_block_fragmentation_and_reassembly() {
    let msg = message(Some(wide_body()));
    let blocks = msg.to_blocks();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].payload().len(), MAX_BLOCK_PAYLOAD);
    assert_eq!(blocks[1].payload().len(), 380 - MAX_BLOCK_PAYLOAD);
    assert!(!blocks[0].e_bit());
    assert!(blocks[1].e_bit());
    assert_eq!(blocks[0].block_number(), 1);
    assert_eq!(blocks[1].block_number(), 2);
    assert!(blocks.iter().all(Secs1MessageBlock::sum_check));
    assert!(blocks[0].is_next_block(&blocks[1]));
    assert!(!blocks[1].is_next_block(&blocks[0]));
    assert!(!blocks[0].is_same_block(&blocks[1]));
    assert!(blocks[0].is_same_block(&blocks[0].clone()));

    let rebuilt = Secs1Message::from_blocks(blocks).unwrap();
    assert_eq!(rebuilt, msg);
    assert_eq!(rebuilt.body(), Some(&wide_body()));
  }

  #[test]
  fn header_bits_round_trip_through_blocks() {
    let msg = Secs1Message::new(1, 13, true, None, [1, 2, 3, 4], 0x7FFF, true).unwrap();
    let block = &msg.to_blocks()[0];
    assert!(block.r_bit());
    assert!(block.w_bit());
    assert_eq!(block.device_id(), 0x7FFF);
    assert_eq!(block.stream(), 1);
    assert_eq!(block.function(), 13);
    assert_eq!(block.system_bytes(), [1, 2, 3, 4]);
    let rebuilt = Secs1Message::from_blocks(std::slice::from_ref(block)).unwrap();
    assert!(rebuilt.r_bit());
    assert_eq!(rebuilt.device_id(), 0x7FFF);
  }

  #[test]
  fn construction_errors() {
    assert_eq!(
      Secs1Message::new(128, 1, false, None, [0; 4], 10, false).unwrap_err(),
      MessageError::StreamRange(128)
    );
    assert_eq!(
      Secs1Message::new(1, 1, false, None, [0; 4], 0x8000, false).unwrap_err(),
      MessageError::DeviceIdRange(0x8000)
    );
    let oversized = Item::Bin(vec![0; MAX_BLOCK_PAYLOAD * MAX_BLOCK_NUMBER + 1]);
    assert_eq!(
      Secs1Message::new(1, 1, false, Some(oversized), [0; 4], 10, false).unwrap_err(),
      MessageError::BlockOverflow
    );
    assert_eq!(
      Secs1Message::from_blocks(&[]).unwrap_err(),
      MessageError::EmptyBlocks
    );
  }

  #[test]
  fn block_from_bytes_validates_shape() {
    let msg = message(None);
    let good = msg.to_blocks()[0].to_bytes().to_vec();
    assert!(Secs1MessageBlock::from_bytes(good.clone()).is_some());

    let mut short = good.clone();
    short.pop();
    assert!(Secs1MessageBlock::from_bytes(short).is_none());

    let mut bad_length = good;
    bad_length[0] = 9;
    assert!(Secs1MessageBlock::from_bytes(bad_length).is_none());
  }

  #[test]
  fn corrupted_block_fails_sum_check() {
    let msg = message(Some(wide_body()));
    let mut bytes = msg.to_blocks()[0].to_bytes().to_vec();
    bytes[12] ^= 0x01;
    let block = Secs1MessageBlock::from_bytes(bytes).unwrap();
    assert!(!block.sum_check());
  }
}
