use std::fmt;

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::Signed;

use crate::heap::HeapId;

/// A run-time value.
///
/// Small values (booleans, integers, custom tags) are stored inline; map
/// payloads live in the [`Heap`](crate::heap::Heap) arena and are referenced
/// via `Ref(HeapId)`. A map payload is never passed by value at user level.
///
/// NOTE: `Clone` is derived, but a cloned `Ref` does not bump the reference
/// count. Counts track *stored* locations only (store slots, derived bases,
/// values held inside map payloads); storing a `Ref` must go through the
/// helpers on [`Memory`](crate::memory::Memory) and
/// [`Heap`](crate::heap::Heap) that maintain them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Bool(bool),
    Int(BigInt),
    /// A value of a user-declared type, represented by an integer tag.
    /// Two custom values compare equal iff their types and tags are identical.
    Custom(CustomValue),
    /// Handle of a map payload stored in the heap arena.
    Ref(HeapId),
    /// Cycle-detection sentinel installed while a definition for the owning
    /// entity is being evaluated. The code identifies the construction frame;
    /// any read of a sentinel aborts with an internal cycle signal carrying
    /// that code. Never observable in a finished state.
    UnderConstruction(u64),
}

/// A value of a user-declared (uninterpreted) type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct CustomValue {
    pub type_name: String,
    pub tag: BigInt,
}

impl Value {
    #[must_use]
    pub fn int(i: i64) -> Self {
        Self::Int(BigInt::from(i))
    }

    #[must_use]
    pub fn custom(type_name: impl Into<String>, tag: i64) -> Self {
        Self::Custom(CustomValue {
            type_name: type_name.into(),
            tag: BigInt::from(tag),
        })
    }

    /// Returns the boolean payload.
    ///
    /// # Panics
    /// Panics if the value is not a boolean; evaluation only calls this on
    /// expressions the external type checker proved boolean.
    #[must_use]
    pub fn as_bool(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            other => panic!("Value::as_bool: not a boolean: {other:?}"),
        }
    }

    /// Returns the integer payload.
    ///
    /// # Panics
    /// Panics if the value is not an integer (see [`Value::as_bool`]).
    #[must_use]
    pub fn as_int(&self) -> &BigInt {
        match self {
            Self::Int(i) => i,
            other => panic!("Value::as_int: not an integer: {other:?}"),
        }
    }

    /// Returns the map reference payload.
    ///
    /// # Panics
    /// Panics if the value is not a map reference (see [`Value::as_bool`]).
    #[must_use]
    pub fn as_ref_id(&self) -> HeapId {
        match self {
            Self::Ref(id) => *id,
            other => panic!("Value::as_ref_id: not a map reference: {other:?}"),
        }
    }

    #[must_use]
    pub fn is_ref(&self) -> bool {
        matches!(self, Self::Ref(_))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<BigInt> for Value {
    fn from(i: BigInt) -> Self {
        Self::Int(i)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Custom(c) => write!(f, "{name}#{tag}", name = c.type_name, tag = c.tag),
            Self::Ref(id) => write!(f, "map@{index}", index = id.index()),
            Self::UnderConstruction(code) => write!(f, "<under construction {code}>"),
        }
    }
}

/// Euclidean division: the unique `(q, r)` with `q * b + r == a` and
/// `0 <= r < |b|`.
///
/// # Panics
/// Panics if `b` is zero; callers raise `DivisionByZero` first.
#[must_use]
pub fn euclidean_div_rem(a: &BigInt, b: &BigInt) -> (BigInt, BigInt) {
    assert!(!num_traits::Zero::is_zero(b), "euclidean_div_rem: zero divisor");
    let r = a.mod_floor(&b.abs());
    let q = (a - &r) / b;
    (q, r)
}
