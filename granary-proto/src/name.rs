use std::{
    fmt::{self, Display},
    ops::Deref,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use bytestring::ByteString;

/// The name of a stream or consumer
///
/// `Name` contains a string that is guaranteed to be a single subject
/// token, meeting the following requirements:
///
/// * The value is not empty
/// * The value has a length less than or equal to 64
/// * The value does not contain `.`, `*`, `>` or any whitespace character
///
/// Names appear as tokens inside control API subjects, which is why
/// they are restricted to a single literal token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(ByteString);

impl Name {
    /// Construct `Name` from a static string
    ///
    /// # Panics
    ///
    /// Will panic if `value` isn't a valid `Name`
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        Self::try_from(ByteString::from_static(value)).expect("invalid Name")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl TryFrom<ByteString> for Name {
    type Error = NameValidateError;

    fn try_from(value: ByteString) -> Result<Self, Self::Error> {
        validate_name(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<String> for Name {
    type Error = NameValidateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_name(&value)?;
        Ok(Self(value.into()))
    }
}

impl TryFrom<&str> for Name {
    type Error = NameValidateError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate_name(value)?;
        Ok(Self(value.into()))
    }
}

impl From<Name> for ByteString {
    fn from(value: Name) -> Self {
        value.0
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Name {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl Serialize for Name {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_str().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = ByteString::deserialize(deserializer)?;
        s.try_into().map_err(de::Error::custom)
    }
}

/// An error encountered while validating [`Name`]
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum NameValidateError {
    /// The value is empty
    #[error("name is empty")]
    Empty,
    /// The value has a length greater than 64
    #[error("name is too long")]
    TooLong,
    /// The value contains `.`, `*`, `>` or whitespace
    #[error("name contained an illegal character")]
    IllegalCharacter,
}

fn validate_name(name: &str) -> Result<(), NameValidateError> {
    if name.is_empty() {
        return Err(NameValidateError::Empty);
    }

    if name.len() > 64 {
        return Err(NameValidateError::TooLong);
    }

    if name.contains(['.', '*', '>']) || name.chars().any(char::is_whitespace) {
        return Err(NameValidateError::IllegalCharacter);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Name, NameValidateError};

    #[test]
    fn valid_names() {
        for name in ["ORDERS", "orders-archive", "wq_1", "A"] {
            let n = Name::try_from(name).unwrap();
            assert_eq!(name, n.as_str());
        }
    }

    #[test]
    fn invalid_names() {
        let names = [
            ("", NameValidateError::Empty),
            ("orders.eu", NameValidateError::IllegalCharacter),
            ("orders*", NameValidateError::IllegalCharacter),
            ("orders>", NameValidateError::IllegalCharacter),
            ("or ders", NameValidateError::IllegalCharacter),
        ];
        for (name, expected_err) in names {
            assert_eq!(expected_err, Name::try_from(name).unwrap_err());
        }
    }
}
