//! Tri-state field values
//!
//! Desired-state fields distinguish "not yet computed" from "explicitly
//! absent", which `Option` cannot express. Every optional field of the
//! desired state is wrapped in [`Tristate`].
//!
//! Serialization treats `Unknown` as an absent key and `Null` as an explicit
//! `null`; pair fields with
//! `#[serde(default, skip_serializing_if = "Tristate::is_unknown")]`
//! so both states survive a round trip.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A value that is unknown, explicitly null, or known
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tristate<T> {
    /// Not yet determined (e.g., computed by the backend but not fetched)
    Unknown,
    /// Explicitly absent
    Null,
    /// Has a concrete value
    Known(T),
}

impl<T> Default for Tristate<T> {
    fn default() -> Self {
        Tristate::Unknown
    }
}

impl<T> Tristate<T> {
    /// An unknown value
    pub fn unknown() -> Self {
        Tristate::Unknown
    }

    /// An explicitly null value
    pub fn null() -> Self {
        Tristate::Null
    }

    /// A known value
    pub fn known(value: T) -> Self {
        Tristate::Known(value)
    }

    /// Convert from an `Option`, mapping `None` to `Null`
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Tristate::Known(v),
            None => Tristate::Null,
        }
    }

    /// True when the value is not yet determined
    pub fn is_unknown(&self) -> bool {
        matches!(self, Tristate::Unknown)
    }

    /// True when the value is explicitly absent
    pub fn is_null(&self) -> bool {
        matches!(self, Tristate::Null)
    }

    /// True when the value is known
    pub fn is_known(&self) -> bool {
        matches!(self, Tristate::Known(_))
    }

    /// True when there is no concrete value, whether null or unknown
    pub fn is_null_or_unknown(&self) -> bool {
        !self.is_known()
    }

    /// Borrow the known value, if any
    pub fn as_known(&self) -> Option<&T> {
        match self {
            Tristate::Known(v) => Some(v),
            _ => None,
        }
    }

    /// Take the known value, if any
    pub fn into_known(self) -> Option<T> {
        match self {
            Tristate::Known(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow the contents, preserving the state
    pub fn as_ref(&self) -> Tristate<&T> {
        match self {
            Tristate::Unknown => Tristate::Unknown,
            Tristate::Null => Tristate::Null,
            Tristate::Known(v) => Tristate::Known(v),
        }
    }

    /// Map the known value, preserving unknown and null
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Tristate<U> {
        match self {
            Tristate::Unknown => Tristate::Unknown,
            Tristate::Null => Tristate::Null,
            Tristate::Known(v) => Tristate::Known(f(v)),
        }
    }

    /// Resolve this value against an incoming plan value.
    ///
    /// Unknown in the plan keeps `self`, null clears, known adopts the plan.
    pub fn merge(&self, incoming: &Self) -> Self
    where
        T: Clone,
    {
        match incoming {
            Tristate::Unknown => self.clone(),
            Tristate::Null => Tristate::Null,
            Tristate::Known(v) => Tristate::Known(v.clone()),
        }
    }
}

impl<T: Default + Clone> Tristate<T> {
    /// The known value, or the type's zero value when null or unknown
    pub fn value_or_default(&self) -> T {
        self.as_known().cloned().unwrap_or_default()
    }
}

impl Tristate<String> {
    /// The known string, or an empty string
    pub fn value_str(&self) -> &str {
        self.as_known().map(String::as_str).unwrap_or_default()
    }
}

impl Tristate<bool> {
    /// The known flag, or `false`
    pub fn value_bool(&self) -> bool {
        matches!(self, Tristate::Known(true))
    }
}

impl<T> From<Option<T>> for Tristate<T> {
    fn from(value: Option<T>) -> Self {
        Tristate::from_option(value)
    }
}

impl<T: Serialize> Serialize for Tristate<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Tristate::Known(v) => serializer.serialize_some(v),
            Tristate::Null | Tristate::Unknown => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Tristate<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(Tristate::from_option)
    }
}
