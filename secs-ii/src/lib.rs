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

//! # SEMI EQUIPMENT COMMUNICATIONS STANDARD 2 (SECS-II) ITEM CODEC
//! **Based on:**
//! - **[SEMI E5]-0712**
//!
//! ---------------------------------------------------------------------------
//!
//! [SECS-II] is a Presentation Protocol designed to facilitate a common
//! communications language between semiconductor equipment. Common Session
//! Protocols for transporting [SECS-II] messages include SECS-I (SEMI E4) and
//! HSMS (SEMI E37).
//!
//! This crate provides:
//! - The [Item] sum type over the SECS-II data formats, with binary encoding
//!   and decoding ([To Bytes], [From Bytes]).
//! - The [SML] text representation of items, both printing ([To SML]) and
//!   parsing ([Parse]).
//!
//! [SEMI E5]:   https://store-us.semi.org/products/e00500-semi-e5-specification-for-semi-equipment-communications-standard-2-message-content-secs-ii
//! [SECS-II]:   crate
//! [Item]:      Item
//! [To Bytes]:  Item::to_bytes
//! [From Bytes]: Item::from_bytes
//! [SML]:       sml
//! [To SML]:    Item::to_sml
//! [Parse]:     sml::parse

#![allow(clippy::unusual_byte_groupings)]

pub mod sml;

use std::fmt;
use thiserror::Error;

/// ## ITEM FORMAT
/// **Based on SEMI E5§9.2.2**
///
/// The list of format codes associated with various [Item] types. This module
/// exists so that these codes can be referenced by name without undue syntax
/// overhead or other restrictions Rust requires when using Enums for a set of
/// constants rather than as a sum type.
///
/// Each constant is the 6-bit format code shifted into the upper bits of the
/// format byte; the low 2 bits of the format byte on the wire carry the count
/// of length bytes which follow.
///
/// [Item]: crate::Item
pub mod format {
  /// ### LIST
  /// **Format Code 0o00**
  pub const LIST: u8 = 0b000000_00;

  /// ### BINARY
  /// **Format Code 0o10**
  pub const BIN: u8 = 0b001000_00;

  /// ### BOOLEAN
  /// **Format Code 0o11**
  pub const BOOL: u8 = 0b001001_00;

  /// ### ASCII
  /// **Format Code 0o20**
  pub const ASCII: u8 = 0b010000_00;

  /// ### 8-BYTE SIGNED INTEGER
  /// **Format Code 0o30**
  pub const I8: u8 = 0b011000_00;

  /// ### 1-BYTE SIGNED INTEGER
  /// **Format Code 0o31**
  pub const I1: u8 = 0b011001_00;

  /// ### 2-BYTE SIGNED INTEGER
  /// **Format Code 0o32**
  pub const I2: u8 = 0b011010_00;

  /// ### 4-BYTE SIGNED INTEGER
  /// **Format Code 0o34**
  pub const I4: u8 = 0b011100_00;

  /// ### 8-BYTE FLOATING POINT NUMBER
  /// **Format Code 0o40**
  pub const F8: u8 = 0b100000_00;

  /// ### 4-BYTE FLOATING POINT NUMBER
  /// **Format Code 0o44**
  pub const F4: u8 = 0b100100_00;

  /// ### 8-BYTE UNSIGNED INTEGER
  /// **Format Code 0o50**
  pub const U8: u8 = 0b101000_00;

  /// ### 1-BYTE UNSIGNED INTEGER
  /// **Format Code 0o51**
  pub const U1: u8 = 0b101001_00;

  /// ### 2-BYTE UNSIGNED INTEGER
  /// **Format Code 0o52**
  pub const U2: u8 = 0b101010_00;

  /// ### 4-BYTE UNSIGNED INTEGER
  /// **Format Code 0o54**
  pub const U4: u8 = 0b101100_00;
}

/// ## ITEM CODEC ERROR
///
/// Represents a failure to encode an [Item] into binary data or to decode
/// binary data into an [Item].
///
/// [Item]: Item
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ItemError {
  /// ### UNKNOWN TYPE
  ///
  /// The format byte does not name a SECS-II item type, or carries a
  /// length-byte count of zero.
  #[error("unrecognized item format byte 0x{0:02X}")]
  UnknownType(u8),

  /// ### TRUNCATED
  ///
  /// The binary data ends before the declared item length.
  #[error("item bytes end before the declared length")]
  Truncated,

  /// ### NOT ASCII
  ///
  /// An ASCII item carries a byte above 0x7F. ASCII items are 7-bit,
  /// both on encode and on decode.
  #[error("ASCII item accepts only 7-bit characters")]
  NotAscii,

  /// ### MISALIGNED NUMERIC
  ///
  /// The payload length of a numeric item is not a multiple of the element
  /// size.
  #[error("numeric item length {length} is not a multiple of {element_size}")]
  MisalignedNumeric {
    length: usize,
    element_size: usize,
  },

  /// ### TRAILING BYTES
  ///
  /// Bytes remain after the outer item when decoding a complete body.
  #[error("{remaining} bytes remain after the outer item")]
  TrailingBytes {
    remaining: usize,
  },

  /// ### INTEGER OVERFLOW
  ///
  /// A value does not fit in the declared integer item type.
  #[error("value {value} does not fit in {type_name}")]
  IntegerOverflow {
    value: i128,
    type_name: &'static str,
  },

  /// ### INDEX OUT OF RANGE
  ///
  /// A value getter was given an index beyond the end of a list.
  #[error("index {index} out of range for list of length {len}")]
  IndexOutOfRange {
    index: usize,
    len: usize,
  },

  /// ### NOT A LIST
  ///
  /// A value getter attempted to descend into a non-list item.
  #[error("cannot index into {0} item")]
  NotAList(&'static str),
}

/// ## GENERIC ITEM
/// **Based on SEMI E5§9**
///
/// An [Item] is an information packet which has a length defined by the first
/// 2, 3, or 4 bytes.
///
/// These first bytes are called the Item Header. The Item Header consists of
/// the Format Byte and the Length Bytes.
///
/// - Bits 1 to 2 of the Item Header tell how many of the following bytes
///   refer to the length of the item.
/// - The Item Length refers to the number of bytes following the Item Header,
///   called the Item Body, which is the actual data of the item. For a [List]
///   the Item Length counts elements rather than bytes.
/// - Bits 3 to 8 of the Item Header define the format of the data which
///   follows.
///
/// Items are immutable after construction; encoded forms may be cached by
/// the message types which own them.
///
/// [Item]: Item
/// [List]: Item::List
#[repr(u8)]
#[derive(Clone, Debug, PartialEq)]
pub enum Item {
  /// ### LIST
  /// **Based on SEMI E5§9.3**
  ///
  /// An ordered set of elements, where elements are [Item]s. The Item Length
  /// of a List counts the number of [Item]s it contains, rather than the
  /// number of bytes.
  List(Vec<Item>) = format::LIST,

  /// ### ASCII
  ///
  /// 7-bit character string.
  Ascii(String) = format::ASCII,

  /// ### BINARY
  ///
  /// Single-byte quantity where the value can be anything and does not
  /// otherwise have a strictly defined meaning.
  Bin(Vec<u8>) = format::BIN,

  /// ### BOOLEAN
  ///
  /// Single-byte quantity where a value of 0 is equivalent to 'false' and any
  /// non-zero value is equivalent to 'true'.
  Bool(Vec<bool>) = format::BOOL,

  /// ### 1-BYTE SIGNED INTEGER
  I1(Vec<i8>) = format::I1,

  /// ### 2-BYTE SIGNED INTEGER
  I2(Vec<i16>) = format::I2,

  /// ### 4-BYTE SIGNED INTEGER
  I4(Vec<i32>) = format::I4,

  /// ### 8-BYTE SIGNED INTEGER
  I8(Vec<i64>) = format::I8,

  /// ### 1-BYTE UNSIGNED INTEGER
  U1(Vec<u8>) = format::U1,

  /// ### 2-BYTE UNSIGNED INTEGER
  U2(Vec<u16>) = format::U2,

  /// ### 4-BYTE UNSIGNED INTEGER
  U4(Vec<u32>) = format::U4,

  /// ### 8-BYTE UNSIGNED INTEGER
  U8(Vec<u64>) = format::U8,

  /// ### 4-BYTE FLOATING POINT NUMBER
  F4(Vec<f32>) = format::F4,

  /// ### 8-BYTE FLOATING POINT NUMBER
  F8(Vec<f64>) = format::F8,
}

/// ## CONSTRUCTORS
impl Item {
  /// ### LIST ITEM
  pub fn list(items: Vec<Item>) -> Self {
    Self::List(items)
  }

  /// ### ASCII ITEM
  ///
  /// Constructs an [ASCII] [Item], rejecting text containing characters
  /// above 0x7F with [Not ASCII].
  ///
  /// [Item]:      Item
  /// [ASCII]:     Item::Ascii
  /// [Not ASCII]: ItemError::NotAscii
  pub fn ascii(text: impl Into<String>) -> Result<Self, ItemError> {
    let text: String = text.into();
    if !text.is_ascii() {
      return Err(ItemError::NotAscii);
    }
    Ok(Self::Ascii(text))
  }

  /// ### SINGLE BINARY ITEM
  ///
  /// Constructs a [Binary] [Item] with a single member.
  ///
  /// Provided for convinient syntax of this common use case.
  ///
  /// [Item]:   Item
  /// [Binary]: Item::Bin
  pub fn bin(value: u8) -> Self {
    Self::Bin(vec![value])
  }

  /// ### SINGLE BOOLEAN ITEM
  ///
  /// Constructs a [Boolean] [Item] with a single member.
  ///
  /// [Item]:    Item
  /// [Boolean]: Item::Bool
  pub fn bool(value: bool) -> Self {
    Self::Bool(vec![value])
  }

  /// ### SINGLE 1-BYTE SIGNED INTEGER ITEM
  pub fn i1(value: i8) -> Self {
    Self::I1(vec![value])
  }

  /// ### SINGLE 2-BYTE SIGNED INTEGER ITEM
  pub fn i2(value: i16) -> Self {
    Self::I2(vec![value])
  }

  /// ### SINGLE 4-BYTE SIGNED INTEGER ITEM
  pub fn i4(value: i32) -> Self {
    Self::I4(vec![value])
  }

  /// ### SINGLE 8-BYTE SIGNED INTEGER ITEM
  pub fn i8(value: i64) -> Self {
    Self::I8(vec![value])
  }

  /// ### SINGLE 1-BYTE UNSIGNED INTEGER ITEM
  pub fn u1(value: u8) -> Self {
    Self::U1(vec![value])
  }

  /// ### SINGLE 2-BYTE UNSIGNED INTEGER ITEM
  pub fn u2(value: u16) -> Self {
    Self::U2(vec![value])
  }

  /// ### SINGLE 4-BYTE UNSIGNED INTEGER ITEM
  pub fn u4(value: u32) -> Self {
    Self::U4(vec![value])
  }

  /// ### SINGLE 8-BYTE UNSIGNED INTEGER ITEM
  pub fn u8(value: u64) -> Self {
    Self::U8(vec![value])
  }

  /// ### SINGLE 4-BYTE FLOATING POINT NUMBER ITEM
  pub fn f4(value: f32) -> Self {
    Self::F4(vec![value])
  }

  /// ### SINGLE 8-BYTE FLOATING POINT NUMBER ITEM
  pub fn f8(value: f64) -> Self {
    Self::F8(vec![value])
  }

  /// ### CHECKED SIGNED INTEGER ITEM
  ///
  /// Builds the signed integer item named by `code` (one of [I1], [I2],
  /// [I4], [I8] in [format]) from 64-bit values, checking each against the
  /// item's domain.
  ///
  /// [I1]:     format::I1
  /// [I2]:     format::I2
  /// [I4]:     format::I4
  /// [I8]:     format::I8
  /// [format]: format
  pub fn signed(code: u8, values: &[i64]) -> Result<Self, ItemError> {
    fn narrow<T: TryFrom<i64>>(values: &[i64], type_name: &'static str) -> Result<Vec<T>, ItemError> {
      values
        .iter()
        .map(|&value| {
          T::try_from(value).map_err(|_| ItemError::IntegerOverflow {
            value: i128::from(value),
            type_name,
          })
        })
        .collect()
    }
    match code {
      format::I1 => Ok(Self::I1(narrow(values, "I1")?)),
      format::I2 => Ok(Self::I2(narrow(values, "I2")?)),
      format::I4 => Ok(Self::I4(narrow(values, "I4")?)),
      format::I8 => Ok(Self::I8(values.to_vec())),
      _ => Err(ItemError::UnknownType(code)),
    }
  }

  /// ### CHECKED UNSIGNED INTEGER ITEM
  ///
  /// Builds the unsigned integer item named by `code` (one of [U1], [U2],
  /// [U4], [U8] in [format]) from 64-bit values, checking each against the
  /// item's domain.
  ///
  /// [U1]:     format::U1
  /// [U2]:     format::U2
  /// [U4]:     format::U4
  /// [U8]:     format::U8
  /// [format]: format
  pub fn unsigned(code: u8, values: &[u64]) -> Result<Self, ItemError> {
    fn narrow<T: TryFrom<u64>>(values: &[u64], type_name: &'static str) -> Result<Vec<T>, ItemError> {
      values
        .iter()
        .map(|&value| {
          T::try_from(value).map_err(|_| ItemError::IntegerOverflow {
            value: i128::from(value),
            type_name,
          })
        })
        .collect()
    }
    match code {
      format::U1 => Ok(Self::U1(narrow(values, "U1")?)),
      format::U2 => Ok(Self::U2(narrow(values, "U2")?)),
      format::U4 => Ok(Self::U4(narrow(values, "U4")?)),
      format::U8 => Ok(Self::U8(values.to_vec())),
      _ => Err(ItemError::UnknownType(code)),
    }
  }
}

/// ## INSPECTION
impl Item {
  /// ### FORMAT CODE
  ///
  /// The 6-bit format code of this item, shifted into the upper bits of the
  /// format byte, matching the constants in [format].
  ///
  /// [format]: format
  pub fn format_code(&self) -> u8 {
    match self {
      Item::List(_)  => format::LIST,
      Item::Ascii(_) => format::ASCII,
      Item::Bin(_)   => format::BIN,
      Item::Bool(_)  => format::BOOL,
      Item::I1(_)    => format::I1,
      Item::I2(_)    => format::I2,
      Item::I4(_)    => format::I4,
      Item::I8(_)    => format::I8,
      Item::U1(_)    => format::U1,
      Item::U2(_)    => format::U2,
      Item::U4(_)    => format::U4,
      Item::U8(_)    => format::U8,
      Item::F4(_)    => format::F4,
      Item::F8(_)    => format::F8,
    }
  }

  /// ### FORMAT NAME
  ///
  /// The SML name of this item's type.
  pub fn format_name(&self) -> &'static str {
    match self {
      Item::List(_)  => "L",
      Item::Ascii(_) => "A",
      Item::Bin(_)   => "B",
      Item::Bool(_)  => "BOOLEAN",
      Item::I1(_)    => "I1",
      Item::I2(_)    => "I2",
      Item::I4(_)    => "I4",
      Item::I8(_)    => "I8",
      Item::U1(_)    => "U1",
      Item::U2(_)    => "U2",
      Item::U4(_)    => "U4",
      Item::U8(_)    => "U8",
      Item::F4(_)    => "F4",
      Item::F8(_)    => "F8",
    }
  }

  /// ### ELEMENT COUNT
  ///
  /// The number of elements this item carries: child items for a [List],
  /// characters for [ASCII], values otherwise.
  ///
  /// [List]:  Item::List
  /// [ASCII]: Item::Ascii
  pub fn len(&self) -> usize {
    match self {
      Item::List(items) => items.len(),
      Item::Ascii(text) => text.len(),
      Item::Bin(vec)    => vec.len(),
      Item::Bool(vec)   => vec.len(),
      Item::I1(vec)     => vec.len(),
      Item::I2(vec)     => vec.len(),
      Item::I4(vec)     => vec.len(),
      Item::I8(vec)     => vec.len(),
      Item::U1(vec)     => vec.len(),
      Item::U2(vec)     => vec.len(),
      Item::U4(vec)     => vec.len(),
      Item::U8(vec)     => vec.len(),
      Item::F4(vec)     => vec.len(),
      Item::F8(vec)     => vec.len(),
    }
  }

  /// ### IS EMPTY
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// ### VALUE GETTER BY INDEX PATH
  ///
  /// Descends through nested [List]s by the given indices and returns the
  /// item found there. An empty path returns the item itself.
  ///
  /// [List]: Item::List
  pub fn get(&self, indices: &[usize]) -> Result<&Item, ItemError> {
    let mut item = self;
    for &index in indices {
      match item {
        Item::List(items) => {
          item = items.get(index).ok_or(ItemError::IndexOutOfRange {
            index,
            len: items.len(),
          })?;
        }
        other => return Err(ItemError::NotAList(other.format_name())),
      }
    }
    Ok(item)
  }

  /// ### LIST ACCESSOR
  pub fn as_list(&self) -> Option<&[Item]> {
    match self {
      Item::List(items) => Some(items),
      _ => None,
    }
  }

  /// ### ASCII ACCESSOR
  pub fn as_ascii(&self) -> Option<&str> {
    match self {
      Item::Ascii(text) => Some(text),
      _ => None,
    }
  }

  /// ### BINARY ACCESSOR
  pub fn as_bin(&self) -> Option<&[u8]> {
    match self {
      Item::Bin(vec) => Some(vec),
      _ => None,
    }
  }

  /// ### BOOLEAN ACCESSOR
  pub fn as_bools(&self) -> Option<&[bool]> {
    match self {
      Item::Bool(vec) => Some(vec),
      _ => None,
    }
  }

  /// ### FIRST VALUE AS UNSIGNED
  ///
  /// The first element of a [Binary] or unsigned integer item, widened to
  /// 64 bits.
  ///
  /// [Binary]: Item::Bin
  pub fn first_unsigned(&self) -> Option<u64> {
    match self {
      Item::Bin(vec) => vec.first().map(|&v| u64::from(v)),
      Item::U1(vec)  => vec.first().map(|&v| u64::from(v)),
      Item::U2(vec)  => vec.first().map(|&v| u64::from(v)),
      Item::U4(vec)  => vec.first().map(|&v| u64::from(v)),
      Item::U8(vec)  => vec.first().copied(),
      _ => None,
    }
  }

  /// ### FIRST VALUE AS SIGNED
  ///
  /// The first element of a signed integer item, widened to 64 bits.
  pub fn first_signed(&self) -> Option<i64> {
    match self {
      Item::I1(vec) => vec.first().map(|&v| i64::from(v)),
      Item::I2(vec) => vec.first().map(|&v| i64::from(v)),
      Item::I4(vec) => vec.first().map(|&v| i64::from(v)),
      Item::I8(vec) => vec.first().copied(),
      _ => None,
    }
  }
}

/// ## BINARY CODEC
/// **Based on SEMI E5§9.2-9.3**
impl Item {
  /// ### ITEM -> BINARY DATA
  ///
  /// Encodes the item to its wire form: one format byte, the minimal count
  /// of big-endian length bytes (1 if the length is below 256, 2 below
  /// 65536, 3 otherwise), then children or raw values.
  ///
  /// Fails with [Not ASCII] if an [ASCII] item carries text above 0x7F.
  ///
  /// [ASCII]:     Item::Ascii
  /// [Not ASCII]: ItemError::NotAscii
  pub fn to_bytes(&self) -> Result<Vec<u8>, ItemError> {
    let mut vec: Vec<u8> = vec![];
    self.encode_into(&mut vec)?;
    Ok(vec)
  }

  fn encode_into(&self, vec: &mut Vec<u8>) -> Result<(), ItemError> {
    fn header(vec: &mut Vec<u8>, code: u8, len: usize) {
      if len < 256 {
        vec.push(code | 1);
        vec.push(len as u8);
      } else if len < 65536 {
        vec.push(code | 2);
        vec.extend_from_slice(&(len as u16).to_be_bytes());
      } else {
        vec.push(code | 3);
        vec.extend_from_slice(&(len as u32).to_be_bytes()[1..4]);
      }
    }
    match self {
      // List length counts elements, not bytes.
      Item::List(items) => {
        header(vec, format::LIST, items.len());
        for item in items {
          item.encode_into(vec)?;
        }
      }
      Item::Ascii(text) => {
        if !text.is_ascii() {
          return Err(ItemError::NotAscii);
        }
        header(vec, format::ASCII, text.len());
        vec.extend_from_slice(text.as_bytes());
      }
      Item::Bin(bin_vec) => {
        header(vec, format::BIN, bin_vec.len());
        vec.extend_from_slice(bin_vec);
      }
      Item::Bool(bool_vec) => {
        header(vec, format::BOOL, bool_vec.len());
        for &b in bool_vec {
          vec.push(if b { 0xFF } else { 0x00 });
        }
      }
      Item::I1(vv) => {
        header(vec, format::I1, vv.len());
        for v in vv {
          vec.extend_from_slice(&v.to_be_bytes());
        }
      }
      Item::I2(vv) => {
        header(vec, format::I2, vv.len() * 2);
        for v in vv {
          vec.extend_from_slice(&v.to_be_bytes());
        }
      }
      Item::I4(vv) => {
        header(vec, format::I4, vv.len() * 4);
        for v in vv {
          vec.extend_from_slice(&v.to_be_bytes());
        }
      }
      Item::I8(vv) => {
        header(vec, format::I8, vv.len() * 8);
        for v in vv {
          vec.extend_from_slice(&v.to_be_bytes());
        }
      }
      Item::U1(vv) => {
        header(vec, format::U1, vv.len());
        vec.extend_from_slice(vv);
      }
      Item::U2(vv) => {
        header(vec, format::U2, vv.len() * 2);
        for v in vv {
          vec.extend_from_slice(&v.to_be_bytes());
        }
      }
      Item::U4(vv) => {
        header(vec, format::U4, vv.len() * 4);
        for v in vv {
          vec.extend_from_slice(&v.to_be_bytes());
        }
      }
      Item::U8(vv) => {
        header(vec, format::U8, vv.len() * 8);
        for v in vv {
          vec.extend_from_slice(&v.to_be_bytes());
        }
      }
      Item::F4(vv) => {
        header(vec, format::F4, vv.len() * 4);
        for v in vv {
          vec.extend_from_slice(&v.to_be_bytes());
        }
      }
      Item::F8(vv) => {
        header(vec, format::F8, vv.len() * 8);
        for v in vv {
          vec.extend_from_slice(&v.to_be_bytes());
        }
      }
    }
    Ok(())
  }

  /// ### BINARY DATA -> ITEM
  ///
  /// Decodes one item from the front of the given bytes and returns it
  /// together with the number of bytes consumed.
  pub fn from_bytes(bytes: &[u8]) -> Result<(Item, usize), ItemError> {
    let (item, end) = Self::decode_at(bytes, 0)?;
    Ok((item, end))
  }

  /// ### COMPLETE BODY -> ITEM
  ///
  /// Decodes the given bytes as exactly one item, failing with
  /// [Trailing Bytes] if any bytes remain after it.
  ///
  /// [Trailing Bytes]: ItemError::TrailingBytes
  pub fn from_body_bytes(bytes: &[u8]) -> Result<Item, ItemError> {
    let (item, end) = Self::decode_at(bytes, 0)?;
    if end != bytes.len() {
      return Err(ItemError::TrailingBytes {
        remaining: bytes.len() - end,
      });
    }
    Ok(item)
  }

  fn decode_at(bytes: &[u8], pos: usize) -> Result<(Item, usize), ItemError> {
    let format_byte = *bytes.get(pos).ok_or(ItemError::Truncated)?;
    let code = format_byte & 0b111111_00;
    let length_bytes = (format_byte & 0b000000_11) as usize;
    if length_bytes == 0 {
      return Err(ItemError::UnknownType(format_byte));
    }
    if pos + 1 + length_bytes > bytes.len() {
      return Err(ItemError::Truncated);
    }
    let mut length: usize = 0;
    for i in 0..length_bytes {
      length = (length << 8) | bytes[pos + 1 + i] as usize;
    }
    let body = pos + 1 + length_bytes;

    // For everything but a list, `length` is the payload byte count.
    fn payload(bytes: &[u8], body: usize, length: usize) -> Result<&[u8], ItemError> {
      let end = body.checked_add(length).ok_or(ItemError::Truncated)?;
      if end > bytes.len() {
        return Err(ItemError::Truncated);
      }
      Ok(&bytes[body..end])
    }
    fn numeric(bytes: &[u8], body: usize, length: usize, size: usize) -> Result<&[u8], ItemError> {
      if length % size != 0 {
        return Err(ItemError::MisalignedNumeric {
          length,
          element_size: size,
        });
      }
      payload(bytes, body, length)
    }

    match code {
      format::LIST => {
        let mut items: Vec<Item> = vec![];
        let mut p = body;
        for _ in 0..length {
          let (item, next) = Self::decode_at(bytes, p)?;
          items.push(item);
          p = next;
        }
        Ok((Item::List(items), p))
      }
      format::ASCII => {
        let vv = payload(bytes, body, length)?;
        if !vv.is_ascii() {
          return Err(ItemError::NotAscii);
        }
        let text = String::from_utf8(vv.to_vec()).map_err(|_| ItemError::NotAscii)?;
        Ok((Item::Ascii(text), body + length))
      }
      format::BIN => {
        let vv = payload(bytes, body, length)?;
        Ok((Item::Bin(vv.to_vec()), body + length))
      }
      format::BOOL => {
        let vv = payload(bytes, body, length)?;
        Ok((Item::Bool(vv.iter().map(|&b| b != 0x00).collect()), body + length))
      }
      format::I1 => {
        let vv = numeric(bytes, body, length, 1)?;
        Ok((Item::I1(vv.iter().map(|&b| b as i8).collect()), body + length))
      }
      format::I2 => {
        let vv = numeric(bytes, body, length, 2)?;
        let values = vv.chunks_exact(2).map(|c| i16::from_be_bytes([c[0], c[1]])).collect();
        Ok((Item::I2(values), body + length))
      }
      format::I4 => {
        let vv = numeric(bytes, body, length, 4)?;
        let values = vv.chunks_exact(4).map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]])).collect();
        Ok((Item::I4(values), body + length))
      }
      format::I8 => {
        let vv = numeric(bytes, body, length, 8)?;
        let values = vv
          .chunks_exact(8)
          .map(|c| i64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
          .collect();
        Ok((Item::I8(values), body + length))
      }
      format::U1 => {
        let vv = numeric(bytes, body, length, 1)?;
        Ok((Item::U1(vv.to_vec()), body + length))
      }
      format::U2 => {
        let vv = numeric(bytes, body, length, 2)?;
        let values = vv.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
        Ok((Item::U2(values), body + length))
      }
      format::U4 => {
        let vv = numeric(bytes, body, length, 4)?;
        let values = vv.chunks_exact(4).map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]])).collect();
        Ok((Item::U4(values), body + length))
      }
      format::U8 => {
        let vv = numeric(bytes, body, length, 8)?;
        let values = vv
          .chunks_exact(8)
          .map(|c| u64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
          .collect();
        Ok((Item::U8(values), body + length))
      }
      format::F4 => {
        let vv = numeric(bytes, body, length, 4)?;
        let values = vv.chunks_exact(4).map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]])).collect();
        Ok((Item::F4(values), body + length))
      }
      format::F8 => {
        let vv = numeric(bytes, body, length, 8)?;
        let values = vv
          .chunks_exact(8)
          .map(|c| f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
          .collect();
        Ok((Item::F8(values), body + length))
      }
      _ => Err(ItemError::UnknownType(format_byte)),
    }
  }
}

/// ## SML PRINTING
impl Item {
  /// ### ITEM -> SML
  ///
  /// Renders the item in SML: scalars on a single line as
  /// `<TYPE [n] v1 v2 ...>`, lists hierarchically with a two-space indent
  /// and one item per line. The output parses back to an equal item with
  /// [Parse].
  ///
  /// [Parse]: sml::parse
  pub fn to_sml(&self) -> String {
    self.sml_indented("")
  }

  fn sml_indented(&self, level: &str) -> String {
    match self {
      Item::List(items) => {
        let mut lines: Vec<String> = vec![format!("{}<L [{}]", level, items.len())];
        let deeper = format!("{}  ", level);
        for item in items {
          lines.push(item.sml_indented(&deeper));
        }
        lines.push(format!("{}>", level));
        lines.join("\n")
      }
      Item::Ascii(text) => format!("{}<A [{}] {}>", level, text.len(), sml_ascii_value(text)),
      Item::Bin(vv) => {
        let values: Vec<String> = vv.iter().map(|v| format!("0x{:02X}", v)).collect();
        format!("{}<B [{}] {}>", level, vv.len(), values.join(" "))
      }
      Item::Bool(vv) => {
        let values: Vec<&str> = vv.iter().map(|&v| if v { "TRUE" } else { "FALSE" }).collect();
        format!("{}<BOOLEAN [{}] {}>", level, vv.len(), values.join(" "))
      }
      Item::I1(vv) => sml_numeric_line(level, "I1", vv.len(), vv.iter().map(|v| v.to_string())),
      Item::I2(vv) => sml_numeric_line(level, "I2", vv.len(), vv.iter().map(|v| v.to_string())),
      Item::I4(vv) => sml_numeric_line(level, "I4", vv.len(), vv.iter().map(|v| v.to_string())),
      Item::I8(vv) => sml_numeric_line(level, "I8", vv.len(), vv.iter().map(|v| v.to_string())),
      Item::U1(vv) => sml_numeric_line(level, "U1", vv.len(), vv.iter().map(|v| v.to_string())),
      Item::U2(vv) => sml_numeric_line(level, "U2", vv.len(), vv.iter().map(|v| v.to_string())),
      Item::U4(vv) => sml_numeric_line(level, "U4", vv.len(), vv.iter().map(|v| v.to_string())),
      Item::U8(vv) => sml_numeric_line(level, "U8", vv.len(), vv.iter().map(|v| v.to_string())),
      Item::F4(vv) => sml_numeric_line(level, "F4", vv.len(), vv.iter().map(|v| format!("{:?}", v))),
      Item::F8(vv) => sml_numeric_line(level, "F8", vv.len(), vv.iter().map(|v| format!("{:?}", v))),
    }
  }
}

fn sml_numeric_line(
  level: &str,
  name: &str,
  len: usize,
  values: impl Iterator<Item = String>,
) -> String {
  let values: Vec<String> = values.collect();
  format!("{}<{} [{}] {}>", level, name, len, values.join(" "))
}

/// Quotable runs stay inside double quotes; the quote character itself and
/// control characters are written as 0xNN byte escapes.
fn sml_ascii_value(text: &str) -> String {
  if text.is_empty() {
    return "\"\"".to_string();
  }
  let mut parts: Vec<String> = vec![];
  let mut run = String::new();
  for ch in text.chars() {
    if ch == '"' || (ch as u32) < 0x20 || (ch as u32) == 0x7F {
      if !run.is_empty() {
        parts.push(format!("\"{}\"", run));
        run.clear();
      }
      parts.push(format!("0x{:02X}", ch as u32));
    } else {
      run.push(ch);
    }
  }
  if !run.is_empty() {
    parts.push(format!("\"{}\"", run));
  }
  parts.join(" ")
}

impl fmt::Display for Item {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_sml())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn encode_decode_nested_list() {
    let item = Item::List(vec![
      Item::ascii("MDLN-A").unwrap(),
      Item::List(vec![Item::u4(1001), Item::bool(true)]),
      Item::I2(vec![-1, 2, -3]),
    ]);
    let bytes = item.to_bytes().unwrap();
    let decoded = Item::from_body_bytes(&bytes).unwrap();
    assert_eq!(decoded, item);
  }

  #[test]
  fn empty_list_encodes_to_two_bytes() {
    let bytes = Item::List(vec![]).to_bytes().unwrap();
    assert_eq!(bytes, vec![format::LIST | 1, 0]);
  }

  #[test]
  fn length_byte_count_is_minimal() {
    for (len, lbytes) in [(0usize, 1usize), (255, 1), (256, 2), (65535, 2), (65536, 3)] {
      let bytes = Item::Bin(vec![0; len]).to_bytes().unwrap();
      assert_eq!((bytes[0] & 0b11) as usize, lbytes, "payload length {}", len);
      assert_eq!(bytes.len(), 1 + lbytes + len);
    }
  }

  #[test]
  fn ascii_rejects_high_characters() {
    assert_eq!(Item::ascii("héllo").unwrap_err(), ItemError::NotAscii);
    assert_eq!(
      Item::Ascii("héllo".to_string()).to_bytes().unwrap_err(),
      ItemError::NotAscii
    );
  }

  #[test]
  fn decode_rejects_unknown_format() {
    // 0b111111_01 names no SECS-II type.
    let err = Item::from_body_bytes(&[0b111111_01, 0]).unwrap_err();
    assert_eq!(err, ItemError::UnknownType(0b111111_01));
  }

  #[test]
  fn decode_rejects_zero_length_bytes() {
    let err = Item::from_body_bytes(&[format::BIN, 0]).unwrap_err();
    assert_eq!(err, ItemError::UnknownType(format::BIN));
  }

  #[test]
  fn decode_rejects_misaligned_numeric() {
    let err = Item::from_body_bytes(&[format::U2 | 1, 3, 0, 1, 2]).unwrap_err();
    assert_eq!(
      err,
      ItemError::MisalignedNumeric {
        length: 3,
        element_size: 2
      }
    );
  }

  #[test]
  fn decode_rejects_truncated_payload() {
    let err = Item::from_body_bytes(&[format::BIN | 1, 4, 1, 2]).unwrap_err();
    assert_eq!(err, ItemError::Truncated);
  }

  #[test]
  fn decode_rejects_trailing_bytes() {
    let err = Item::from_body_bytes(&[format::BIN | 1, 1, 7, 0xAA]).unwrap_err();
    assert_eq!(err, ItemError::TrailingBytes { remaining: 1 });
  }

  #[test]
  fn from_bytes_reports_consumed() {
    let mut bytes = Item::u2(513).to_bytes().unwrap();
    let item_len = bytes.len();
    bytes.extend_from_slice(&[1, 2, 3]);
    let (item, consumed) = Item::from_bytes(&bytes).unwrap();
    assert_eq!(item, Item::u2(513));
    assert_eq!(consumed, item_len);
  }

  #[test]
  fn boolean_decodes_nonzero_as_true() {
    let (item, _) = Item::from_bytes(&[format::BOOL | 1, 3, 0x00, 0x01, 0xFF]).unwrap();
    assert_eq!(item, Item::Bool(vec![false, true, true]));
  }

  #[test]
  fn checked_integer_builders_enforce_the_domain() {
    assert_eq!(
      Item::signed(format::I1, &[127, -128]).unwrap(),
      Item::I1(vec![127, -128])
    );
    assert_eq!(
      Item::signed(format::I1, &[128]).unwrap_err(),
      ItemError::IntegerOverflow {
        value: 128,
        type_name: "I1"
      }
    );
    assert_eq!(
      Item::unsigned(format::U2, &[65535]).unwrap(),
      Item::U2(vec![65535])
    );
    assert_eq!(
      Item::unsigned(format::U2, &[65536]).unwrap_err(),
      ItemError::IntegerOverflow {
        value: 65536,
        type_name: "U2"
      }
    );
    assert_eq!(
      Item::signed(format::U1, &[1]).unwrap_err(),
      ItemError::UnknownType(format::U1)
    );
  }

  #[test]
  fn get_descends_by_index_path() {
    let item = Item::List(vec![
      Item::ascii("a").unwrap(),
      Item::List(vec![Item::u1(7), Item::u1(8)]),
    ]);
    assert_eq!(item.get(&[1, 0]).unwrap(), &Item::u1(7));
    assert_eq!(
      item.get(&[1, 5]).unwrap_err(),
      ItemError::IndexOutOfRange { index: 5, len: 2 }
    );
    assert_eq!(item.get(&[0, 0]).unwrap_err(), ItemError::NotAList("A"));
  }

  #[test]
  fn list_sml_is_hierarchical() {
    let item = Item::List(vec![
      Item::ascii("MDLN-A").unwrap(),
      Item::List(vec![Item::u4(1001)]),
    ]);
    let sml = item.to_sml();
    let expected = "<L [2]\n  <A [6] \"MDLN-A\">\n  <L [1]\n    <U4 [1] 1001>\n  >\n>";
    assert_eq!(sml, expected);
  }
}
