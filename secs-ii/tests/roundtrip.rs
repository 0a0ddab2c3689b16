//! Round-trip laws of the item codec and its SML form.

use proptest::prelude::*;
use secs_ii::{sml, Item};

fn ascii_string() -> impl Strategy<Value = String> {
  proptest::collection::vec(0u8..=0x7F, 0..32)
    .prop_map(|v| v.into_iter().map(|b| b as char).collect())
}

fn item_strategy() -> impl Strategy<Value = Item> {
  let leaf = proptest::strategy::Union::new(vec![
    ascii_string().prop_map(Item::Ascii).boxed(),
    proptest::collection::vec(any::<u8>(), 0..24).prop_map(Item::Bin).boxed(),
    proptest::collection::vec(any::<bool>(), 0..24).prop_map(Item::Bool).boxed(),
    proptest::collection::vec(any::<i8>(), 0..24).prop_map(Item::I1).boxed(),
    proptest::collection::vec(any::<i16>(), 0..24).prop_map(Item::I2).boxed(),
    proptest::collection::vec(any::<i32>(), 0..24).prop_map(Item::I4).boxed(),
    proptest::collection::vec(any::<i64>(), 0..24).prop_map(Item::I8).boxed(),
    proptest::collection::vec(any::<u8>(), 0..24).prop_map(Item::U1).boxed(),
    proptest::collection::vec(any::<u16>(), 0..24).prop_map(Item::U2).boxed(),
    proptest::collection::vec(any::<u32>(), 0..24).prop_map(Item::U4).boxed(),
    proptest::collection::vec(any::<u64>(), 0..24).prop_map(Item::U8).boxed(),
    proptest::collection::vec(-1.0e30f32..1.0e30f32, 0..8).prop_map(Item::F4).boxed(),
    proptest::collection::vec(-1.0e300f64..1.0e300f64, 0..8).prop_map(Item::F8).boxed(),
  ]);
  leaf.prop_recursive(3, 48, 5, |inner| {
    proptest::collection::vec(inner, 0..5).prop_map(Item::List)
  })
}

proptest! {
  #[test]
  fn binary_round_trip(item in item_strategy()) {
    let bytes = item.to_bytes().unwrap();
    let decoded = Item::from_body_bytes(&bytes).unwrap();
    prop_assert_eq!(decoded, item);
  }

  #[test]
  fn sml_round_trip(item in item_strategy()) {
    let text = item.to_sml();
    let parsed = sml::parse_item(&text).unwrap();
    prop_assert_eq!(parsed, item);
  }

  #[test]
  fn length_byte_count_is_minimal(len in 0usize..70_000) {
    let bytes = Item::Bin(vec![0xA5; len]).to_bytes().unwrap();
    let lbytes = (bytes[0] & 0b11) as usize;
    let expected = if len < 256 { 1 } else if len < 65_536 { 2 } else { 3 };
    prop_assert_eq!(lbytes, expected);
    prop_assert_eq!(bytes.len(), 1 + lbytes + len);
  }
}
