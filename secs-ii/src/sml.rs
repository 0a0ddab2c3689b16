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

//! # SML PARSER
//!
//! SML is the text representation of SECS-II messages and items:
//!
//! ```text
//! message := 'S' int 'F' int ('W')? item? '.'
//! item    := '<' TYPE ('[' int ']')? value* '>'
//! ```
//!
//! Whitespace is liberal. ASCII literal values may be written as quoted
//! strings or as `0xNN` byte escapes that must decode to 7-bit ASCII.
//! Integer tokens accept decimal and `0x...` hexadecimal forms for binary
//! and integer items. BOOLEAN accepts `TRUE`, `T`, `FALSE` and `F`,
//! case-insensitive.
//!
//! Parse failures carry a kind and the byte position at which the failure
//! was detected.

use crate::Item;
use thiserror::Error;

/// ## PARSED SML MESSAGE
///
/// The result of parsing a message form `S<stream>F<function> [W] [item] .`:
/// the stream and function numbers, the reply-expected flag, and the optional
/// single item body.
#[derive(Clone, Debug, PartialEq)]
pub struct SmlMessage {
  pub stream: u8,
  pub function: u8,
  pub w_bit: bool,
  pub body: Option<Item>,
}

/// ## SML PARSE ERROR
///
/// A lexical or structural failure, with the byte position at which it was
/// detected.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{kind} at position {position}")]
pub struct SmlError {
  pub kind: SmlErrorKind,
  pub position: usize,
}

/// ## SML PARSE ERROR KIND
#[derive(Clone, Debug, PartialEq, Error)]
pub enum SmlErrorKind {
  /// The message does not end with the `.` terminator.
  #[error("SML message does not end with '.'")]
  MissingPeriod,

  /// The message does not begin with a valid `S<int>F<int>` header, or a
  /// stream/function number is out of range.
  #[error("malformed message header")]
  BadHeader,

  /// A specific character was required.
  #[error("expected '{0}'")]
  Expected(char),

  /// A character that cannot begin any value was found.
  #[error("unexpected character '{0}'")]
  UnexpectedChar(char),

  /// The text ended inside an item.
  #[error("unexpected end of SML text")]
  UnexpectedEnd,

  /// An item type name is not one of the SECS-II types.
  #[error("unknown item type '{0}'")]
  UnknownType(String),

  /// An ASCII item value is outside the 7-bit range.
  #[error("ASCII item accepts only 7-bit characters")]
  NotAscii,

  /// A BOOLEAN token is not one of TRUE, T, FALSE, F.
  #[error("BOOLEAN accepts TRUE or FALSE, found '{0}'")]
  BadBoolean(String),

  /// A numeric token is malformed.
  #[error("malformed number '{0}'")]
  BadNumber(String),

  /// A numeric token does not fit in the item type.
  #[error("value '{0}' does not fit in the item type")]
  IntegerOverflow(String),

  /// Text remains after the message terminator.
  #[error("text remains after the message terminator")]
  TrailingText,
}

/// ### PARSE MESSAGE
///
/// Parses a complete SML message, `S<stream>F<function> [W] [item] .`.
pub fn parse(text: &str) -> Result<SmlMessage, SmlError> {
  let mut sc = Scanner::new(text);
  sc.skip_ws();

  match sc.bump() {
    Some(b'S') | Some(b's') => {}
    _ => return Err(sc.err_at(sc.pos.saturating_sub(1), SmlErrorKind::BadHeader)),
  }
  let stream = sc.read_header_number(127)?;
  match sc.bump() {
    Some(b'F') | Some(b'f') => {}
    _ => return Err(sc.err_at(sc.pos.saturating_sub(1), SmlErrorKind::BadHeader)),
  }
  let function = sc.read_header_number(255)?;

  sc.skip_ws();
  let w_bit = matches!(sc.peek(), Some(b'W') | Some(b'w'));
  if w_bit {
    sc.bump();
  }

  sc.skip_ws();
  let body = if sc.peek() == Some(b'<') {
    Some(sc.parse_item()?)
  } else {
    None
  };

  sc.skip_ws();
  match sc.bump() {
    Some(b'.') => {}
    _ => return Err(sc.err(SmlErrorKind::MissingPeriod)),
  }
  sc.skip_ws();
  if sc.peek().is_some() {
    return Err(sc.err(SmlErrorKind::TrailingText));
  }

  Ok(SmlMessage {
    stream,
    function,
    w_bit,
    body,
  })
}

/// ### PARSE ITEM
///
/// Parses a single bare item, `<TYPE [n] value*>`, with nothing around it.
pub fn parse_item(text: &str) -> Result<Item, SmlError> {
  let mut sc = Scanner::new(text);
  sc.skip_ws();
  let item = sc.parse_item()?;
  sc.skip_ws();
  if sc.peek().is_some() {
    return Err(sc.err(SmlErrorKind::TrailingText));
  }
  Ok(item)
}

struct Scanner<'a> {
  bytes: &'a [u8],
  pos: usize,
}

impl<'a> Scanner<'a> {
  fn new(text: &'a str) -> Self {
    Scanner {
      bytes: text.as_bytes(),
      pos: 0,
    }
  }

  fn err(&self, kind: SmlErrorKind) -> SmlError {
    SmlError {
      kind,
      position: self.pos,
    }
  }

  fn err_at(&self, position: usize, kind: SmlErrorKind) -> SmlError {
    SmlError { kind, position }
  }

  fn peek(&self) -> Option<u8> {
    self.bytes.get(self.pos).copied()
  }

  fn bump(&mut self) -> Option<u8> {
    let b = self.peek()?;
    self.pos += 1;
    Some(b)
  }

  // Anything at or below 0x20 counts as whitespace.
  fn skip_ws(&mut self) {
    while matches!(self.peek(), Some(b) if b <= 0x20) {
      self.pos += 1;
    }
  }

  fn expect(&mut self, ch: u8) -> Result<(), SmlError> {
    match self.bump() {
      Some(b) if b == ch => Ok(()),
      Some(_) => Err(self.err_at(self.pos - 1, SmlErrorKind::Expected(ch as char))),
      None => Err(self.err(SmlErrorKind::UnexpectedEnd)),
    }
  }

  fn read_header_number(&mut self, max: u32) -> Result<u8, SmlError> {
    let start = self.pos;
    let mut value: u32 = 0;
    while let Some(b @ b'0'..=b'9') = self.peek() {
      value = value * 10 + u32::from(b - b'0');
      self.pos += 1;
      if value > 999 {
        break;
      }
    }
    if self.pos == start || value > max {
      return Err(self.err_at(start, SmlErrorKind::BadHeader));
    }
    Ok(value as u8)
  }

  fn parse_item(&mut self) -> Result<Item, SmlError> {
    self.skip_ws();
    self.expect(b'<')?;
    self.skip_ws();

    let name_start = self.pos;
    while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric()) {
      self.pos += 1;
    }
    let name: String = String::from_utf8_lossy(&self.bytes[name_start..self.pos]).to_ascii_uppercase();
    if name.is_empty() {
      return Err(self.err(SmlErrorKind::UnknownType(String::new())));
    }

    // The bracketed size is informational only.
    self.skip_ws();
    if self.peek() == Some(b'[') {
      self.bump();
      loop {
        match self.bump() {
          Some(b']') => break,
          Some(b) if b.is_ascii_digit() || b <= 0x20 => {}
          Some(b) => return Err(self.err_at(self.pos - 1, SmlErrorKind::UnexpectedChar(b as char))),
          None => return Err(self.err(SmlErrorKind::UnexpectedEnd)),
        }
      }
    }

    match name.as_str() {
      "L" => {
        let mut items: Vec<Item> = vec![];
        loop {
          self.skip_ws();
          match self.peek() {
            Some(b'>') => {
              self.bump();
              return Ok(Item::List(items));
            }
            Some(b'<') => items.push(self.parse_item()?),
            Some(b) => return Err(self.err(SmlErrorKind::UnexpectedChar(b as char))),
            None => return Err(self.err(SmlErrorKind::UnexpectedEnd)),
          }
        }
      }
      "A" => self.parse_ascii_values(),
      "BOOLEAN" => {
        let (raw, start) = self.read_until_close()?;
        let mut values: Vec<bool> = vec![];
        for token in raw.split_whitespace() {
          match token.to_ascii_uppercase().as_str() {
            "TRUE" | "T" => values.push(true),
            "FALSE" | "F" => values.push(false),
            _ => return Err(self.err_at(start, SmlErrorKind::BadBoolean(token.to_string()))),
          }
        }
        Ok(Item::Bool(values))
      }
      "B" => {
        let (raw, start) = self.read_until_close()?;
        let values = parse_unsigned_tokens(&raw, u64::from(u8::MAX))
          .map_err(|kind| self.err_at(start, kind))?;
        Ok(Item::Bin(values.into_iter().map(|v| v as u8).collect()))
      }
      "U1" => self.parse_unsigned_item(u64::from(u8::MAX), |vv| {
        Item::U1(vv.into_iter().map(|v| v as u8).collect())
      }),
      "U2" => self.parse_unsigned_item(u64::from(u16::MAX), |vv| {
        Item::U2(vv.into_iter().map(|v| v as u16).collect())
      }),
      "U4" => self.parse_unsigned_item(u64::from(u32::MAX), |vv| {
        Item::U4(vv.into_iter().map(|v| v as u32).collect())
      }),
      "U8" => self.parse_unsigned_item(u64::MAX, Item::U8),
      "I1" => self.parse_signed_item(i64::from(i8::MIN), i64::from(i8::MAX), |vv| {
        Item::I1(vv.into_iter().map(|v| v as i8).collect())
      }),
      "I2" => self.parse_signed_item(i64::from(i16::MIN), i64::from(i16::MAX), |vv| {
        Item::I2(vv.into_iter().map(|v| v as i16).collect())
      }),
      "I4" => self.parse_signed_item(i64::from(i32::MIN), i64::from(i32::MAX), |vv| {
        Item::I4(vv.into_iter().map(|v| v as i32).collect())
      }),
      "I8" => self.parse_signed_item(i64::MIN, i64::MAX, Item::I8),
      "F4" => {
        let (raw, start) = self.read_until_close()?;
        let mut values: Vec<f32> = vec![];
        for token in raw.split_whitespace() {
          values.push(
            token
              .parse::<f32>()
              .map_err(|_| self.err_at(start, SmlErrorKind::BadNumber(token.to_string())))?,
          );
        }
        Ok(Item::F4(values))
      }
      "F8" => {
        let (raw, start) = self.read_until_close()?;
        let mut values: Vec<f64> = vec![];
        for token in raw.split_whitespace() {
          values.push(
            token
              .parse::<f64>()
              .map_err(|_| self.err_at(start, SmlErrorKind::BadNumber(token.to_string())))?,
          );
        }
        Ok(Item::F8(values))
      }
      _ => Err(self.err_at(name_start, SmlErrorKind::UnknownType(name))),
    }
  }

  /// Consumes the raw value run up to (and including) the closing `>` of a
  /// scalar item, returning the run and its start position.
  fn read_until_close(&mut self) -> Result<(String, usize), SmlError> {
    let start = self.pos;
    loop {
      match self.peek() {
        Some(b'>') => {
          let raw = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
          self.bump();
          return Ok((raw, start));
        }
        Some(_) => {
          self.pos += 1;
        }
        None => return Err(self.err(SmlErrorKind::UnexpectedEnd)),
      }
    }
  }

  fn parse_unsigned_item(
    &mut self,
    max: u64,
    build: impl FnOnce(Vec<u64>) -> Item,
  ) -> Result<Item, SmlError> {
    let (raw, start) = self.read_until_close()?;
    let values = parse_unsigned_tokens(&raw, max).map_err(|kind| self.err_at(start, kind))?;
    Ok(build(values))
  }

  fn parse_signed_item(
    &mut self,
    min: i64,
    max: i64,
    build: impl FnOnce(Vec<i64>) -> Item,
  ) -> Result<Item, SmlError> {
    let (raw, start) = self.read_until_close()?;
    let mut values: Vec<i64> = vec![];
    for token in raw.split_whitespace() {
      let value = parse_int_token(token).map_err(|kind| self.err_at(start, kind))?;
      if value < i128::from(min) || value > i128::from(max) {
        return Err(self.err_at(start, SmlErrorKind::IntegerOverflow(token.to_string())));
      }
      values.push(value as i64);
    }
    Ok(build(values))
  }

  fn parse_ascii_values(&mut self) -> Result<Item, SmlError> {
    let mut text = String::new();
    loop {
      self.skip_ws();
      match self.peek() {
        Some(b'>') => {
          self.bump();
          // Construction cannot fail: every accepted character is 7-bit.
          return Item::ascii(text).map_err(|_| self.err(SmlErrorKind::NotAscii));
        }
        Some(b'"') => {
          self.bump();
          loop {
            match self.bump() {
              Some(b'"') => break,
              Some(b) if b < 0x80 => text.push(b as char),
              Some(_) => return Err(self.err_at(self.pos - 1, SmlErrorKind::NotAscii)),
              None => return Err(self.err(SmlErrorKind::UnexpectedEnd)),
            }
          }
        }
        Some(b'0') => {
          let start = self.pos;
          let token = self.read_escape_token();
          match parse_int_token(&token) {
            Ok(v) if (0..=0x7F).contains(&v) => text.push((v as u8) as char),
            Ok(_) => return Err(self.err_at(start, SmlErrorKind::NotAscii)),
            Err(kind) => return Err(self.err_at(start, kind)),
          }
        }
        Some(b) => return Err(self.err(SmlErrorKind::UnexpectedChar(b as char))),
        None => return Err(self.err(SmlErrorKind::UnexpectedEnd)),
      }
    }
  }

  fn read_escape_token(&mut self) -> String {
    let start = self.pos;
    while matches!(self.peek(), Some(b) if b > 0x20 && b != b'"' && b != b'>') {
      self.pos += 1;
    }
    String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned()
  }
}

fn parse_int_token(token: &str) -> Result<i128, SmlErrorKind> {
  if let Some(hex) = token
    .strip_prefix("0x")
    .or_else(|| token.strip_prefix("0X"))
  {
    u64::from_str_radix(hex, 16)
      .map(i128::from)
      .map_err(|_| SmlErrorKind::BadNumber(token.to_string()))
  } else {
    token
      .parse::<i128>()
      .map_err(|_| SmlErrorKind::BadNumber(token.to_string()))
  }
}

fn parse_unsigned_tokens(raw: &str, max: u64) -> Result<Vec<u64>, SmlErrorKind> {
  let mut values: Vec<u64> = vec![];
  for token in raw.split_whitespace() {
    let value = parse_int_token(token)?;
    if value < 0 || value > i128::from(max) {
      return Err(SmlErrorKind::IntegerOverflow(token.to_string()));
    }
    values.push(value as u64);
  }
  Ok(values)
}
