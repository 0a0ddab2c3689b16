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

//! # GENERIC EQUIPMENT MODEL (GEM) HELPERS
//! **Based on SEMI E30**
//!
//! A small set of standard transactions issued over any [SECS Communicator]:
//! establish communications (S1F13/F14), offline and online requests
//! (S1F15-F18), date and time exchange (S2F17/F18, S2F31/F32), and the
//! S9Fx error reports carrying the reference message's header.
//!
//! [SECS Communicator]: secs_core::SecsCommunicator

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use secs_core::{ClockType, CommunicatorConfig, SecsCommunicator, SecsMessage};
use secs_ii::Item;
use std::sync::Arc;
use thiserror::Error;

/// ## GEM ERROR
#[derive(Debug, Error)]
pub enum GemError<E: std::error::Error + 'static> {
  /// The underlying communicator failed the transaction.
  #[error(transparent)]
  Comm(E),

  /// The reply was absent or its body did not have the expected shape.
  #[error("unexpected or missing reply for {transaction}")]
  UnexpectedReply { transaction: &'static str },

  /// A clock item was not a 12- or 16-character time.
  #[error("clock item is not a 12- or 16-character time")]
  BadClock,
}

/// ## COMMACK
///
/// Establish-communications acknowledge, S1F14.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum CommAck {
  /// ### ACCEPTED
  Accepted = 0,

  /// ### DENIED
  Denied = 1,
}

/// ## OFLACK
///
/// Offline acknowledge, S1F16.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum OffLineAck {
  /// ### ACKNOWLEDGED
  Acknowledged = 0,
}

/// ## ONLACK
///
/// Online acknowledge, S1F18.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum OnLineAck {
  /// ### ACCEPTED
  Accepted = 0,

  /// ### REFUSED
  Refused = 1,

  /// ### ALREADY ONLINE
  AlreadyOnline = 2,
}

/// ## TIACK
///
/// Time-set acknowledge, S2F32.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum TimeAck {
  /// ### ACCEPTED
  Accepted = 0,

  /// ### NOT DONE
  NotDone = 1,
}

/// ## GEM CLOCK
///
/// The time value of the S2F17/F18 and S2F31/F32 transactions, rendered as
/// an ASCII item in the A12 (`yymmddhhmmss`) or A16 (`yyyymmddhhmmsscc`)
/// form.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Clock {
  datetime: NaiveDateTime,
}

impl Clock {
  /// ### CLOCK OF A DATETIME
  pub fn new(datetime: NaiveDateTime) -> Self {
    Clock { datetime }
  }

  /// ### CLOCK OF THE LOCAL TIME
  pub fn now() -> Self {
    Clock {
      datetime: chrono::Local::now().naive_local(),
    }
  }

  /// ### DATETIME VALUE
  pub fn datetime(&self) -> NaiveDateTime {
    self.datetime
  }

  /// ### A16 ITEM
  ///
  /// `yyyymmddhhmmsscc`, the trailing two characters counting centiseconds.
  pub fn to_a16(&self) -> Item {
    let centis = self.datetime.nanosecond() / 10_000_000;
    Item::Ascii(format!(
      "{}{:02}",
      self.datetime.format("%Y%m%d%H%M%S"),
      centis.min(99)
    ))
  }

  /// ### A12 ITEM
  ///
  /// `yymmddhhmmss`.
  pub fn to_a12(&self) -> Item {
    Item::Ascii(self.datetime.format("%y%m%d%H%M%S").to_string())
  }

  /// ### ITEM OF THE CONFIGURED FORM
  pub fn to_item(&self, clock_type: ClockType) -> Item {
    match clock_type {
      ClockType::A12 => self.to_a12(),
      ClockType::A16 => self.to_a16(),
    }
  }

  /// ### CLOCK FROM AN ASCII ITEM
  ///
  /// Accepts both forms. Two-digit years resolve into the century window
  /// nearest the current date.
  pub fn from_ascii<E: std::error::Error + 'static>(item: &Item) -> Result<Self, GemError<E>> {
    let text = item.as_ascii().ok_or(GemError::BadClock)?;
    if !text.bytes().all(|b| b.is_ascii_digit()) {
      return Err(GemError::BadClock);
    }
    let field = |from: usize, to: usize| -> Result<u32, GemError<E>> {
      text
        .get(from..to)
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or(GemError::BadClock)
    };
    let (year, offset, micros) = match text.len() {
      12 => (resolve_year(field(0, 2)? as i32), 2, 0),
      16 => (field(0, 4)? as i32, 4, field(14, 16)? * 10_000),
      _ => return Err(GemError::BadClock),
    };
    let datetime = NaiveDate::from_ymd_opt(year, field(offset, offset + 2)?, field(offset + 2, offset + 4)?)
      .and_then(|date| {
        date.and_hms_micro_opt(
          field(offset + 4, offset + 6).ok()?,
          field(offset + 6, offset + 8).ok()?,
          field(offset + 8, offset + 10).ok()?,
          micros,
        )
      })
      .ok_or(GemError::BadClock)?;
    Ok(Clock { datetime })
  }
}

/// Places a two-digit year into the century window nearest the present: in
/// the opening quarter of a century, years 75-99 belong to the previous
/// one; in the closing quarter, years 00-24 belong to the next.
fn resolve_year(yy: i32) -> i32 {
  let now_year = chrono::Local::now().year();
  let century = now_year / 100 * 100;
  let fraction = now_year % 100;
  if fraction < 25 && yy >= 75 {
    century - 100 + yy
  } else if fraction >= 75 && yy < 25 {
    century + 100 + yy
  } else {
    century + yy
  }
}

/// ## GEM HELPER
///
/// Issues the standard transactions over a shared communicator. Not owned
/// by the communicator; it holds its own handle.
pub struct Gem<C: SecsCommunicator> {
  communicator: Arc<C>,
  mdln: String,
  softrev: String,
  clock_type: ClockType,
}

impl<C: SecsCommunicator> Gem<C> {
  /// ### NEW GEM HELPER
  ///
  /// Pulls MDLN, SOFTREV, and the clock form from the communicator's
  /// parameter settings.
  pub fn new(communicator: Arc<C>, config: &CommunicatorConfig) -> Self {
    Gem {
      communicator,
      mdln: config.gem_mdln.clone(),
      softrev: config.gem_softrev.clone(),
      clock_type: config.gem_clock_type,
    }
  }

  fn reply_of(
    result: Result<Option<C::Message>, C::Error>,
    transaction: &'static str,
  ) -> Result<C::Message, GemError<C::Error>> {
    result
      .map_err(GemError::Comm)?
      .ok_or(GemError::UnexpectedReply { transaction })
  }

  fn mdln_softrev_list(&self) -> Item {
    if self.communicator.is_equip() {
      Item::List(vec![
        Item::Ascii(self.mdln.clone()),
        Item::Ascii(self.softrev.clone()),
      ])
    } else {
      Item::List(vec![])
    }
  }

  /// ### S1F13, ESTABLISH COMMUNICATIONS REQUEST
  ///
  /// Returns the COMMACK of the S1F14 reply.
  pub fn s1f13(&self) -> Result<CommAck, GemError<C::Error>> {
    let reply = Self::reply_of(
      self
        .communicator
        .send(1, 13, true, Some(self.mdln_softrev_list())),
      "S1F14",
    )?;
    let ack = reply
      .body()
      .and_then(|body| body.get(&[0]).ok())
      .and_then(Item::first_unsigned)
      .and_then(|value| CommAck::try_from(value as u8).ok())
      .ok_or(GemError::UnexpectedReply {
        transaction: "S1F14",
      })?;
    Ok(ack)
  }

  /// ### S1F14, ESTABLISH COMMUNICATIONS ACKNOWLEDGE
  pub fn s1f14(
    &self,
    primary: &C::Message,
    commack: CommAck,
  ) -> Result<(), GemError<C::Error>> {
    let body = Item::List(vec![
      Item::bin(commack.into()),
      self.mdln_softrev_list(),
    ]);
    self
      .communicator
      .reply(primary, 1, 14, false, Some(body))
      .map_err(GemError::Comm)
  }

  /// ### S1F15, OFFLINE REQUEST
  pub fn s1f15(&self) -> Result<OffLineAck, GemError<C::Error>> {
    let reply = Self::reply_of(self.communicator.send(1, 15, true, None), "S1F16")?;
    reply
      .body()
      .and_then(Item::first_unsigned)
      .and_then(|value| OffLineAck::try_from(value as u8).ok())
      .ok_or(GemError::UnexpectedReply {
        transaction: "S1F16",
      })
  }

  /// ### S1F16, OFFLINE ACKNOWLEDGE
  pub fn s1f16(&self, primary: &C::Message) -> Result<(), GemError<C::Error>> {
    self
      .communicator
      .reply(
        primary,
        1,
        16,
        false,
        Some(Item::bin(OffLineAck::Acknowledged.into())),
      )
      .map_err(GemError::Comm)
  }

  /// ### S1F17, ONLINE REQUEST
  pub fn s1f17(&self) -> Result<OnLineAck, GemError<C::Error>> {
    let reply = Self::reply_of(self.communicator.send(1, 17, true, None), "S1F18")?;
    reply
      .body()
      .and_then(Item::first_unsigned)
      .and_then(|value| OnLineAck::try_from(value as u8).ok())
      .ok_or(GemError::UnexpectedReply {
        transaction: "S1F18",
      })
  }

  /// ### S1F18, ONLINE ACKNOWLEDGE
  pub fn s1f18(
    &self,
    primary: &C::Message,
    onlack: OnLineAck,
  ) -> Result<(), GemError<C::Error>> {
    self
      .communicator
      .reply(primary, 1, 18, false, Some(Item::bin(onlack.into())))
      .map_err(GemError::Comm)
  }

  /// ### S2F17, DATE AND TIME REQUEST
  pub fn s2f17(&self) -> Result<Clock, GemError<C::Error>> {
    let reply = Self::reply_of(self.communicator.send(2, 17, true, None), "S2F18")?;
    let body = reply.body().ok_or(GemError::UnexpectedReply {
      transaction: "S2F18",
    })?;
    Clock::from_ascii(body)
  }

  /// ### S2F18, DATE AND TIME RESPONSE
  pub fn s2f18(
    &self,
    primary: &C::Message,
    clock: Clock,
  ) -> Result<(), GemError<C::Error>> {
    self
      .communicator
      .reply(primary, 2, 18, false, Some(clock.to_item(self.clock_type)))
      .map_err(GemError::Comm)
  }

  /// ### S2F18 WITH THE CURRENT TIME
  pub fn s2f18_now(&self, primary: &C::Message) -> Result<(), GemError<C::Error>> {
    self.s2f18(primary, Clock::now())
  }

  /// ### S2F31, DATE AND TIME SET REQUEST
  pub fn s2f31(&self, clock: Clock) -> Result<TimeAck, GemError<C::Error>> {
    let reply = Self::reply_of(
      self
        .communicator
        .send(2, 31, true, Some(clock.to_item(self.clock_type))),
      "S2F32",
    )?;
    reply
      .body()
      .and_then(Item::first_unsigned)
      .and_then(|value| TimeAck::try_from(value as u8).ok())
      .ok_or(GemError::UnexpectedReply {
        transaction: "S2F32",
      })
  }

  /// ### S2F31 WITH THE CURRENT TIME
  pub fn s2f31_now(&self) -> Result<TimeAck, GemError<C::Error>> {
    self.s2f31(Clock::now())
  }

  /// ### S2F32, DATE AND TIME SET ACKNOWLEDGE
  pub fn s2f32(
    &self,
    primary: &C::Message,
    tiack: TimeAck,
  ) -> Result<(), GemError<C::Error>> {
    self
      .communicator
      .reply(primary, 2, 32, false, Some(Item::bin(tiack.into())))
      .map_err(GemError::Comm)
  }

  fn s9fy(&self, reference: &C::Message, function: u8) -> Result<(), GemError<C::Error>> {
    self
      .communicator
      .send(
        9,
        function,
        false,
        Some(Item::Bin(reference.header10().to_vec())),
      )
      .map_err(GemError::Comm)?;
    Ok(())
  }

  /// ### S9F1, UNKNOWN DEVICE ID
  pub fn s9f1(&self, reference: &C::Message) -> Result<(), GemError<C::Error>> {
    self.s9fy(reference, 1)
  }

  /// ### S9F3, UNKNOWN STREAM
  pub fn s9f3(&self, reference: &C::Message) -> Result<(), GemError<C::Error>> {
    self.s9fy(reference, 3)
  }

  /// ### S9F5, UNKNOWN FUNCTION
  pub fn s9f5(&self, reference: &C::Message) -> Result<(), GemError<C::Error>> {
    self.s9fy(reference, 5)
  }

  /// ### S9F7, ILLEGAL DATA
  pub fn s9f7(&self, reference: &C::Message) -> Result<(), GemError<C::Error>> {
    self.s9fy(reference, 7)
  }

  /// ### S9F9, TRANSACTION TIMEOUT
  pub fn s9f9(&self, reference: &C::Message) -> Result<(), GemError<C::Error>> {
    self.s9fy(reference, 9)
  }

  /// ### S9F11, DATA TOO LONG
  pub fn s9f11(&self, reference: &C::Message) -> Result<(), GemError<C::Error>> {
    self.s9fy(reference, 11)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::convert::Infallible;

  // Infallible stands in for a communicator error type in clock tests.
  type ClockResult = Result<Clock, GemError<std::io::Error>>;

  fn datetime(text: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f").unwrap()
  }

  #[test]
  fn a16_renders_and_parses() {
    let clock = Clock::new(datetime("2024-07-09 13:05:59.420"));
    let item = clock.to_a16();
    assert_eq!(item.as_ascii(), Some("2024070913055942"));
    let parsed: ClockResult = Clock::from_ascii(&item);
    assert_eq!(parsed.unwrap(), clock);
  }

  #[test]
  fn a12_renders_and_parses() {
    let clock = Clock::new(datetime("2024-07-09 13:05:59.0"));
    let item = clock.to_a12();
    assert_eq!(item.as_ascii(), Some("240709130559"));
    let parsed: ClockResult = Clock::from_ascii(&item);
    assert_eq!(parsed.unwrap(), clock);
  }

  #[test]
  fn malformed_clock_items_are_rejected() {
    for text in ["", "2024", "20240709130559", "banana-pancake", "2024070913055x"] {
      let parsed: ClockResult = Clock::from_ascii(&Item::Ascii(text.to_string()));
      assert!(parsed.is_err(), "accepted {:?}", text);
    }
    let parsed: ClockResult = Clock::from_ascii(&Item::u4(1));
    assert!(parsed.is_err());
  }

  #[test]
  fn acknowledge_codes_map_to_bytes() {
    assert_eq!(u8::from(CommAck::Accepted), 0);
    assert_eq!(u8::from(CommAck::Denied), 1);
    assert_eq!(CommAck::try_from(1).unwrap(), CommAck::Denied);
    assert!(CommAck::try_from(2).is_err());
    assert_eq!(OnLineAck::try_from(2).unwrap(), OnLineAck::AlreadyOnline);
    assert_eq!(u8::from(TimeAck::NotDone), 1);
  }

  #[allow(dead_code)]
  fn infallible_is_an_error_type(_: GemError<Infallible>) {}
}
