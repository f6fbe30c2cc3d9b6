//! Canonical lookup keys and the ordered key list backing a pending batch.
//!
//! Identifiers reach the loading layer in several raw shapes: typed integers
//! from application code, decimal strings from route parameters, and JSON
//! numbers or strings from stored rows. The cache, the pending-batch dedup
//! and the result grouper all use value equality on [`Key`], so `"42"` and
//! `42` must collide; normalization is what makes them.

use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};
use std::mem;

use serde_json::Value;

use crate::error::KeyError;

/// A normalized lookup key.
///
/// Numeric identifiers (by far the common case in this system) normalize to
/// [`Key::Id`]; anything non-numeric normalizes to [`Key::Text`]. Equality
/// and hashing on this type define cache and batch-grouping identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Id(i64),
    Text(String),
}

impl Key {
    /// Normalize a JSON value into a canonical key.
    ///
    /// Integral numbers (including whole-valued floats, within the
    /// identifier range) become [`Key::Id`]; strings are trimmed and parsed
    /// as integers where possible. Null, empty strings, fractional,
    /// non-finite or out-of-range numbers, and structured values are
    /// rejected rather than silently cached under a sentinel.
    pub fn normalize(raw: &Value) -> Result<Self, KeyError> {
        match raw {
            Value::Null => Err(KeyError::Null),
            Value::Number(number) => {
                if let Some(id) = number.as_i64() {
                    return Ok(Key::Id(id));
                }
                match number.as_f64().and_then(Key::id_from_float) {
                    Some(id) => Ok(Key::Id(id)),
                    None => Err(KeyError::NonIntegral(number.to_string())),
                }
            }
            Value::String(text) => Key::from_text(text),
            Value::Bool(..) => Err(KeyError::Unsupported("boolean")),
            Value::Array(..) => Err(KeyError::Unsupported("array")),
            Value::Object(..) => Err(KeyError::Unsupported("object")),
        }
    }

    /// Normalize a textual key. Decimal strings collapse to [`Key::Id`].
    pub fn from_text(text: &str) -> Result<Self, KeyError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(KeyError::Empty);
        }
        match trimmed.parse::<i64>() {
            Ok(id) => Ok(Key::Id(id)),
            Err(..) => Ok(Key::Text(trimmed.to_owned())),
        }
    }

    /// Whole, finite floats within the identifier range. The upper bound is
    /// exclusive: `i64::MAX` rounds up to 2^63 as a float, which is already
    /// out of range, and a saturating cast would alias distinct raw keys to
    /// one canonical key.
    fn id_from_float(float: f64) -> Option<i64> {
        if float.is_finite()
            && float.fract() == 0.0
            && float >= i64::MIN as f64
            && float < i64::MAX as f64
        {
            Some(float as i64)
        } else {
            None
        }
    }

    /// The numeric identifier, if this is an id key.
    pub fn as_id(&self) -> Option<i64> {
        match self {
            Key::Id(id) => Some(*id),
            Key::Text(..) => None,
        }
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Key::Id(id) => write!(f, "{}", id),
            Key::Text(text) => f.write_str(text),
        }
    }
}

/// Fallible conversion into a canonical [`Key`], accepted by
/// [`Loader::load`] and friends.
///
/// [`Loader::load`]: crate::Loader::load
pub trait IntoKey {
    fn into_key(self) -> Result<Key, KeyError>;
}

impl IntoKey for Key {
    fn into_key(self) -> Result<Key, KeyError> {
        Ok(self)
    }
}

impl IntoKey for &Key {
    fn into_key(self) -> Result<Key, KeyError> {
        Ok(self.clone())
    }
}

impl IntoKey for i64 {
    fn into_key(self) -> Result<Key, KeyError> {
        Ok(Key::Id(self))
    }
}

impl IntoKey for i32 {
    fn into_key(self) -> Result<Key, KeyError> {
        Ok(Key::Id(i64::from(self)))
    }
}

impl IntoKey for u32 {
    fn into_key(self) -> Result<Key, KeyError> {
        Ok(Key::Id(i64::from(self)))
    }
}

impl IntoKey for u64 {
    fn into_key(self) -> Result<Key, KeyError> {
        if self <= i64::MAX as u64 {
            Ok(Key::Id(self as i64))
        } else {
            Err(KeyError::NonIntegral(self.to_string()))
        }
    }
}

impl IntoKey for f64 {
    fn into_key(self) -> Result<Key, KeyError> {
        match Key::id_from_float(self) {
            Some(id) => Ok(Key::Id(id)),
            None => Err(KeyError::NonIntegral(self.to_string())),
        }
    }
}

impl IntoKey for &str {
    fn into_key(self) -> Result<Key, KeyError> {
        Key::from_text(self)
    }
}

impl IntoKey for String {
    fn into_key(self) -> Result<Key, KeyError> {
        Key::from_text(&self)
    }
}

impl IntoKey for &Value {
    fn into_key(self) -> Result<Key, KeyError> {
        Key::normalize(self)
    }
}

impl IntoKey for Value {
    fn into_key(self) -> Result<Key, KeyError> {
        Key::normalize(&self)
    }
}

/// Insertion-ordered, deduplicating key collection backing a pending batch.
///
/// The order keys were first requested in is the order the batch fetch
/// function receives them in, and the order the grouper aligns results to.
#[derive(Debug, Default)]
pub(crate) struct KeyList {
    order: Vec<Key>,
    seen: HashSet<Key>,
}

impl KeyList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a key unless an identical key is already pending. Duplicate
    /// requests within one batch share a single downstream slot.
    pub(crate) fn insert(&mut self, key: &Key) {
        if self.seen.insert(key.clone()) {
            self.order.push(key.clone());
        }
    }

    /// Number of unique keys currently pending.
    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    /// Seal the list: hand back the ordered unique keys, leaving this
    /// instance empty. Used when the batch transitions to fetching.
    pub(crate) fn take(&mut self) -> Vec<Key> {
        self.seen.clear();
        mem::take(&mut self.order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_and_string_forms_collide() {
        assert_eq!(Key::normalize(&json!(42)).unwrap(), Key::Id(42));
        assert_eq!(Key::normalize(&json!("42")).unwrap(), Key::Id(42));
        assert_eq!(Key::normalize(&json!(42.0)).unwrap(), Key::Id(42));
        assert_eq!(" 42 ".into_key().unwrap(), Key::Id(42));
        assert_eq!(42i64.into_key().unwrap(), Key::Id(42));
    }

    #[test]
    fn non_numeric_strings_stay_textual() {
        assert_eq!(
            Key::normalize(&json!("bsrn")).unwrap(),
            Key::Text("bsrn".to_owned())
        );
        assert_eq!("tccon".into_key().unwrap(), Key::Text("tccon".to_owned()));
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert_eq!(Key::normalize(&Value::Null), Err(KeyError::Null));
        assert_eq!(Key::normalize(&json!("   ")), Err(KeyError::Empty));
        assert_eq!(
            Key::normalize(&json!(1.5)),
            Err(KeyError::NonIntegral("1.5".to_owned()))
        );
        assert_eq!(
            Key::normalize(&json!(true)),
            Err(KeyError::Unsupported("boolean"))
        );
        assert_eq!(
            Key::normalize(&json!([1])),
            Err(KeyError::Unsupported("array"))
        );
        assert!(matches!(
            f64::NAN.into_key(),
            Err(KeyError::NonIntegral(..))
        ));
    }

    #[test]
    fn out_of_range_floats_are_rejected() {
        // These are whole and finite but sit above i64, where a saturating
        // cast would collapse them into one key.
        assert!(matches!(
            Key::normalize(&json!(1.0e19)),
            Err(KeyError::NonIntegral(..))
        ));
        assert!(matches!(
            Key::normalize(&json!(2.0e19)),
            Err(KeyError::NonIntegral(..))
        ));
        assert!(matches!(
            1.0e19f64.into_key(),
            Err(KeyError::NonIntegral(..))
        ));
        assert!(matches!(
            Key::normalize(&json!(-1.0e19)),
            Err(KeyError::NonIntegral(..))
        ));

        // The bottom of the range is exactly representable and still valid.
        assert_eq!(
            (-9.223372036854776e18f64).into_key().unwrap(),
            Key::Id(i64::MIN)
        );
    }

    #[test]
    fn key_list_deduplicates_preserving_order() {
        let mut list = KeyList::new();
        for id in &[3i64, 1, 3, 2, 1] {
            list.insert(&Key::Id(*id));
        }
        assert_eq!(list.len(), 3);
        assert_eq!(list.take(), vec![Key::Id(3), Key::Id(1), Key::Id(2)]);
        assert_eq!(list.len(), 0);
    }
}
