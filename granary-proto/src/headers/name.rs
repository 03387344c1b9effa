use std::{
    fmt::{self, Display},
    ops::Deref,
};
use unicase::UniCase;

use bytestring::ByteString;

/// A string that can be used to represent an header name
///
/// `HeaderName` contains a string that is guaranteed to
/// contain a valid header name that meets the following requirements:
///
/// * The value is not empty
/// * The value has a length less than or equal to 64
/// * The value does not contain any whitespace characters or `:`
///
/// `HeaderName` can be constructed from [`HeaderName::from_static`]
/// or any of the `TryFrom` implementations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HeaderName(UniCase<ByteString>);

impl HeaderName {
    /// Client-defined unique identifier for a message, used to apply
    /// de-duplication within the stream's configured duplicate window
    pub const MESSAGE_ID: Self = Self::new_internal("Granary-Msg-Id");
    /// Assert that the published message is received by the expected stream
    pub const EXPECTED_STREAM: Self = Self::new_internal("Granary-Expected-Stream");
    /// Assert that the last stored [`HeaderName::MESSAGE_ID`] matches this ID
    pub const EXPECTED_LAST_MESSAGE_ID: Self = Self::new_internal("Granary-Expected-Last-Msg-Id");
    /// Assert that the stream's last sequence matches this sequence
    pub const EXPECTED_LAST_SEQUENCE: Self = Self::new_internal("Granary-Expected-Last-Sequence");
    /// Assert that the last sequence for the message's subject matches this sequence
    pub const EXPECTED_LAST_SUBJECT_SEQUENCE: Self =
        Self::new_internal("Granary-Expected-Last-Subject-Sequence");
    /// Replace all prior messages in the stream (`all`) or on the
    /// message's subject (`sub`)
    pub const ROLLUP: Self = Self::new_internal("Granary-Rollup");

    /// Name of the stream a mirrored or sourced message originated from,
    /// together with its origin sequence and subject
    pub const STREAM_SOURCE: Self = Self::new_internal("Granary-Stream-Source");

    /// Name of the stream a message was read back from
    pub const STREAM: Self = Self::new_internal("Granary-Stream");
    /// Original subject of a message that was read back
    pub const SUBJECT: Self = Self::new_internal("Granary-Subject");
    /// Original sequence of a message that was read back
    pub const SEQUENCE: Self = Self::new_internal("Granary-Sequence");
    /// Last sequence of the message having the same subject, or zero if
    /// this is the first message for the subject
    pub const LAST_SEQUENCE: Self = Self::new_internal("Granary-Last-Sequence");
    /// The original RFC3339 timestamp of the message
    pub const TIMESTAMP: Self = Self::new_internal("Granary-Time-Stamp");

    /// Status code attached to control and error messages
    pub const STATUS: Self = Self::new_internal("Status");
    /// Human readable description attached to control and error messages
    pub const DESCRIPTION: Self = Self::new_internal("Description");

    /// Construct `HeaderName` from a static string
    ///
    /// # Panics
    ///
    /// Will panic if `value` isn't a valid `HeaderName`
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        Self::try_from(ByteString::from_static(value)).expect("invalid HeaderName")
    }

    /// Construct a `HeaderName` from a string, without checking invariants
    ///
    /// This method bypasses invariants checks implemented by [`HeaderName::from_static`]
    /// and all `TryFrom` implementations.
    #[expect(
        clippy::missing_panics_doc,
        reason = "The header validation is only made in debug"
    )]
    #[must_use]
    pub fn from_dangerous_value(value: ByteString) -> Self {
        if cfg!(debug_assertions) {
            if let Err(err) = validate_header_name(&value) {
                panic!("HeaderName {value:?} isn't valid {err:?}");
            }
        }
        Self(UniCase::new(value))
    }

    const fn new_internal(value: &'static str) -> Self {
        if value.is_ascii() {
            Self(UniCase::ascii(ByteString::from_static(value)))
        } else {
            Self(UniCase::unicode(ByteString::from_static(value)))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl TryFrom<ByteString> for HeaderName {
    type Error = HeaderNameValidateError;

    fn try_from(value: ByteString) -> Result<Self, Self::Error> {
        validate_header_name(&value)?;
        Ok(Self::from_dangerous_value(value))
    }
}

impl TryFrom<String> for HeaderName {
    type Error = HeaderNameValidateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_header_name(&value)?;
        Ok(Self::from_dangerous_value(value.into()))
    }
}

impl AsRef<str> for HeaderName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for HeaderName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

/// An error encountered while validating [`HeaderName`]
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum HeaderNameValidateError {
    /// The value is empty
    #[error("header name is empty")]
    Empty,
    /// The value has a length greater than 64
    #[error("header name is too long")]
    TooLong,
    /// The value contains an illegal character
    #[error("header name contained an illegal character")]
    IllegalCharacter,
}

fn validate_header_name(name: &str) -> Result<(), HeaderNameValidateError> {
    if name.is_empty() {
        return Err(HeaderNameValidateError::Empty);
    }

    if name.len() > 64 {
        return Err(HeaderNameValidateError::TooLong);
    }

    if name.contains(':') || name.chars().any(char::is_whitespace) {
        return Err(HeaderNameValidateError::IllegalCharacter);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{HeaderName, HeaderNameValidateError};

    #[test]
    fn case_insensitive_equality() {
        assert_eq!(
            HeaderName::MESSAGE_ID,
            HeaderName::from_static("granary-msg-id")
        );
    }

    #[test]
    fn invalid_names() {
        let names = [
            ("", HeaderNameValidateError::Empty),
            ("Granary Msg Id", HeaderNameValidateError::IllegalCharacter),
            ("Granary:Msg", HeaderNameValidateError::IllegalCharacter),
        ];
        for (name, expected_err) in names {
            assert_eq!(
                expected_err,
                HeaderName::try_from(String::from(name)).unwrap_err()
            );
        }
    }
}
