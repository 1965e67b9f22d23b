//! Proptest strategies for fbdb keys, records and schemas.
//!
//! # Usage
//!
//! ```no_run
//! use fbdb_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn keys_sort(keys in strategies::arb_index_keys(100)) {
//!         prop_assert!(keys.iter().all(|k| !k.is_empty()));
//!     }
//! }
//! ```

use proptest::prelude::*;

/// An index key over a small alphabet, so that generated keys share long
/// prefixes and exercise prefix compression.
pub fn arb_index_key() -> impl Strategy<Value = Vec<u8>> {
    "[a-f]{1,6}".prop_map(String::into_bytes)
}

/// Up to `max` index keys, duplicates allowed.
pub fn arb_index_keys(max: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    proptest::collection::vec(arb_index_key(), 1..max.max(2))
}

/// An arbitrary binary key of 1 to 11 bytes.
pub fn arb_binary_key() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..12)
}

/// A record body of 0 to 63 bytes.
pub fn arb_record() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..64)
}

/// A table name matching `[a-z][a-z0-9_]{0,15}`.
pub fn arb_table_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,15}"
}

/// Index field numbers: one to four distinct, non-negative fields.
pub fn arb_index_fields() -> impl Strategy<Value = Vec<i16>> {
    proptest::collection::btree_set(0i16..16, 1..5).prop_map(|s| s.into_iter().collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn index_keys_are_nonempty_and_small(keys in arb_index_keys(50)) {
            prop_assert!(!keys.is_empty() && keys.len() < 50);
            for k in &keys {
                prop_assert!((1..=6).contains(&k.len()));
                prop_assert!(k.iter().all(|b| (b'a'..=b'f').contains(b)));
            }
        }

        #[test]
        fn index_fields_are_sorted_and_distinct(fields in arb_index_fields()) {
            prop_assert!(!fields.is_empty());
            prop_assert!(fields.windows(2).all(|w| w[0] < w[1]));
        }

        #[test]
        fn table_names_start_with_a_letter(name in arb_table_name()) {
            prop_assert!(name.as_bytes()[0].is_ascii_lowercase());
        }
    }
}
