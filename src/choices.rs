/*!
Addressable assignments of random choices.

A [`ChoiceMap`] maps addresses to values. It is used in both directions across the
runtime boundary: as evidence (constraints handed to `generate`/`update`) and as the
set of values a proposal sampled or a trace holds.

# Examples

```rust
use smc_ensemble::choices::{ChoiceMap, ChoiceValue};

let mut obs = ChoiceMap::new();
obs.insert("y1", 0.3);
let mut stratum = ChoiceMap::new();
stratum.insert("k", 2i64);

let constraints = obs.merge(&stratum);
assert_eq!(constraints.len(), 2);
assert_eq!(constraints.get("k"), Some(&ChoiceValue::Int(2)));
```
*/

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use approx::abs_diff_eq;

/// Address of a random choice inside a program trace.
pub type Address = String;

/// A single sampled or observed value.
#[derive(Debug, Clone, Copy)]
pub enum ChoiceValue {
    Real(f64),
    Int(i64),
    Bool(bool),
}

impl ChoiceValue {
    /// Returns the value as a real number, converting integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ChoiceValue::Real(x) => Some(*x),
            ChoiceValue::Int(i) => Some(*i as f64),
            ChoiceValue::Bool(_) => None,
        }
    }

    /// Returns the value if it is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ChoiceValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the value if it is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ChoiceValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Compares two values, allowing reals to differ by at most `epsilon`.
    pub fn approx_eq(&self, other: &ChoiceValue, epsilon: f64) -> bool {
        match (self, other) {
            (ChoiceValue::Real(a), ChoiceValue::Real(b)) => abs_diff_eq!(*a, *b, epsilon = epsilon),
            _ => self == other,
        }
    }
}

// Reals compare by bit pattern so that values can serve as grouping keys.
impl PartialEq for ChoiceValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ChoiceValue::Real(a), ChoiceValue::Real(b)) => a.to_bits() == b.to_bits(),
            (ChoiceValue::Int(a), ChoiceValue::Int(b)) => a == b,
            (ChoiceValue::Bool(a), ChoiceValue::Bool(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ChoiceValue {}

impl Hash for ChoiceValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            ChoiceValue::Real(x) => x.to_bits().hash(state),
            ChoiceValue::Int(i) => i.hash(state),
            ChoiceValue::Bool(b) => b.hash(state),
        }
    }
}

impl From<f64> for ChoiceValue {
    fn from(x: f64) -> Self {
        ChoiceValue::Real(x)
    }
}

impl From<i64> for ChoiceValue {
    fn from(i: i64) -> Self {
        ChoiceValue::Int(i)
    }
}

impl From<bool> for ChoiceValue {
    fn from(b: bool) -> Self {
        ChoiceValue::Bool(b)
    }
}

/// An ordered mapping from addresses to values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ChoiceMap {
    values: BTreeMap<Address, ChoiceValue>,
}

impl ChoiceMap {
    /// Creates an empty choice map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value at `address`, returning the previous value if there was one.
    pub fn insert(
        &mut self,
        address: impl Into<Address>,
        value: impl Into<ChoiceValue>,
    ) -> Option<ChoiceValue> {
        self.values.insert(address.into(), value.into())
    }

    pub fn get(&self, address: &str) -> Option<&ChoiceValue> {
        self.values.get(address)
    }

    /// Returns the real-valued choice at `address`, if present and numeric.
    pub fn get_f64(&self, address: &str) -> Option<f64> {
        self.values.get(address).and_then(ChoiceValue::as_f64)
    }

    pub fn remove(&mut self, address: &str) -> Option<ChoiceValue> {
        self.values.remove(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.values.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.values.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &ChoiceValue)> {
        self.values.iter()
    }

    /// Returns the union of both maps. Values in `other` win on shared addresses.
    pub fn merge(&self, other: &ChoiceMap) -> ChoiceMap {
        let mut merged = self.clone();
        merged.extend_from(other);
        merged
    }

    /// Inserts every entry of `other`, overwriting shared addresses.
    pub fn extend_from(&mut self, other: &ChoiceMap) {
        for (addr, value) in other.iter() {
            self.values.insert(addr.clone(), *value);
        }
    }

    /// Returns the sub-map at the addresses also present in `selection`.
    pub fn restrict(&self, selection: &ChoiceMap) -> ChoiceMap {
        let values = self
            .values
            .iter()
            .filter(|(addr, _)| selection.contains(addr))
            .map(|(addr, value)| (addr.clone(), *value))
            .collect();
        ChoiceMap { values }
    }

    /// Same addresses, and every pair of values within `epsilon` of each other.
    pub fn approx_eq(&self, other: &ChoiceMap, epsilon: f64) -> bool {
        self.len() == other.len()
            && self
                .values
                .iter()
                .zip(other.values.iter())
                .all(|((a1, v1), (a2, v2))| a1 == a2 && v1.approx_eq(v2, epsilon))
    }
}

impl<A: Into<Address>, V: Into<ChoiceValue>> FromIterator<(A, V)> for ChoiceMap {
    fn from_iter<I: IntoIterator<Item = (A, V)>>(iter: I) -> Self {
        let values = iter
            .into_iter()
            .map(|(addr, value)| (addr.into(), value.into()))
            .collect();
        ChoiceMap { values }
    }
}
