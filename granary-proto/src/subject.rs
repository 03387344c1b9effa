use std::{
    fmt::{self, Display},
    ops::Deref,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use bytestring::ByteString;

/// A string that can be used to represent a subject
///
/// `Subject` contains a string that is guaranteed [^1] to
/// contain a valid subject that meets the following requirements:
///
/// * The value is not empty
/// * The value has a length less than or equal to 256
/// * The value does not contain any whitespace characters
/// * The value does not contain wrongly placed `*` or `>` characters
///
/// `Subject` can be constructed from [`Subject::from_static`]
/// or any of the `TryFrom` implementations.
///
/// [^1]: Because [`Subject::from_dangerous_value`] is safe to call,
///       unsafe code must not assume any of the above invariants.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subject(ByteString);

impl Subject {
    /// Construct `Subject` from a static string
    ///
    /// # Panics
    ///
    /// Will panic if `value` isn't a valid `Subject`
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        Self::try_from(ByteString::from_static(value)).expect("invalid Subject")
    }

    /// Construct a `Subject` from a string, without checking invariants
    ///
    /// This method bypasses invariants checks implemented by [`Subject::from_static`]
    /// and all `TryFrom` implementations. Constructing `Subject` from an
    /// invalid string and then routing messages with it can misdeliver
    /// them. When in doubt use [`Subject::from_static`] or any of the
    /// `TryFrom` implementations.
    #[expect(
        clippy::missing_panics_doc,
        reason = "The subject validation is only made in debug"
    )]
    #[must_use]
    pub fn from_dangerous_value(value: ByteString) -> Self {
        if cfg!(debug_assertions) {
            if let Err(err) = validate_subject(&value) {
                panic!("Subject {value:?} isn't valid {err:?}");
            }
        }
        Self(value)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the `.` separated tokens of this subject
    pub fn tokens(&self) -> impl Iterator<Item = &'_ str> {
        self.0.split('.')
    }

    /// Returns `true` if the subject contains no `*` or `>` wildcard tokens
    #[must_use]
    pub fn is_literal(&self) -> bool {
        !self.tokens().any(|token| token == "*" || token == ">")
    }

    /// Returns `true` if `literal` is matched by this subject pattern
    ///
    /// `literal` is expected to be a concrete subject. Wildcard tokens
    /// in `self` match accordingly: `*` matches exactly one token and
    /// `>` matches one or more trailing tokens.
    #[must_use]
    pub fn matches(&self, literal: &Subject) -> bool {
        let mut pattern = self.tokens();
        let mut subject = literal.tokens();

        loop {
            match (pattern.next(), subject.next()) {
                (Some(">"), Some(_)) => return true,
                (Some("*"), Some(_)) => {}
                (Some(p), Some(s)) if p == s => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }

    /// Returns `true` if the set of subjects matched by `self` and
    /// `other` intersect
    ///
    /// Both sides may contain wildcards.
    #[must_use]
    pub fn overlaps(&self, other: &Subject) -> bool {
        let mut a = self.tokens();
        let mut b = other.tokens();

        loop {
            match (a.next(), b.next()) {
                (Some(">"), Some(_)) | (Some(_), Some(">")) => return true,
                (Some("*"), Some(_)) | (Some(_), Some("*")) => {}
                (Some(x), Some(y)) if x == y => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }

    /// Returns `true` if every subject matched by `self` is also
    /// matched by `sup`
    #[must_use]
    pub fn is_subset_of(&self, sup: &Subject) -> bool {
        let mut sub = self.tokens();
        let mut sup = sup.tokens();

        loop {
            match (sub.next(), sup.next()) {
                (Some(_), Some(">")) => return true,
                (Some(">"), Some(_)) => return false,
                (Some(_), Some("*")) => {}
                (Some("*"), Some(_)) => return false,
                (Some(x), Some(y)) if x == y => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl TryFrom<ByteString> for Subject {
    type Error = SubjectValidateError;

    fn try_from(value: ByteString) -> Result<Self, Self::Error> {
        validate_subject(&value)?;
        Ok(Self::from_dangerous_value(value))
    }
}

impl TryFrom<String> for Subject {
    type Error = SubjectValidateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_subject(&value)?;
        Ok(Self::from_dangerous_value(value.into()))
    }
}

impl TryFrom<&str> for Subject {
    type Error = SubjectValidateError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate_subject(value)?;
        Ok(Self::from_dangerous_value(value.into()))
    }
}

impl From<Subject> for ByteString {
    fn from(value: Subject) -> Self {
        value.0
    }
}

impl AsRef<[u8]> for Subject {
    fn as_ref(&self) -> &[u8] {
        self.as_str().as_bytes()
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Subject {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl Serialize for Subject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_str().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Subject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = ByteString::deserialize(deserializer)?;
        s.try_into().map_err(de::Error::custom)
    }
}

/// An error encountered while validating [`Subject`]
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum SubjectValidateError {
    /// The value is empty
    #[error("Subject is empty")]
    Empty,
    /// The value has a length greater than 256
    #[error("Subject is too long")]
    TooLong,
    /// The value contains an Unicode whitespace character
    #[error("Subject contained an illegal whitespace character")]
    IllegalCharacter,
    /// The value contains consecutive `.` characters
    #[error("Subject contained a broken token")]
    BrokenToken,
    /// The value contains `*` or `>` together with other characters
    /// in the same token, or the `>` is in the non-last token
    #[error("Subject contained a broken wildcard")]
    BrokenWildcard,
}

fn validate_subject(subject: &str) -> Result<(), SubjectValidateError> {
    if subject.is_empty() {
        return Err(SubjectValidateError::Empty);
    }

    if subject.len() > 256 {
        return Err(SubjectValidateError::TooLong);
    }

    if subject.chars().any(char::is_whitespace) {
        return Err(SubjectValidateError::IllegalCharacter);
    }

    let mut tokens = subject.split('.').peekable();
    while let Some(token) = tokens.next() {
        if token.is_empty() {
            return Err(SubjectValidateError::BrokenToken);
        }

        if token.len() > 1 && (token.contains(['*', '>'])) {
            return Err(SubjectValidateError::BrokenWildcard);
        }

        if token == ">" && tokens.peek().is_some() {
            return Err(SubjectValidateError::BrokenWildcard);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use bytestring::ByteString;

    use super::{Subject, SubjectValidateError};

    #[test]
    fn valid_subjects() {
        let subjects = [
            "orders",
            "orders.new",
            "orders.eu.new",
            "orders.*.new",
            "orders.*.*",
            "orders.eu.>",
        ];
        for subject in subjects {
            let s = Subject::try_from(ByteString::from_static(subject)).unwrap();
            assert_eq!(subject, s.as_str());
        }
    }

    #[test]
    fn invalid_subjects() {
        let subjects = [
            ("", SubjectValidateError::Empty),
            ("orders ", SubjectValidateError::IllegalCharacter),
            ("orders .new", SubjectValidateError::IllegalCharacter),
            (" orders", SubjectValidateError::IllegalCharacter),
            ("orders.e u", SubjectValidateError::IllegalCharacter),
            ("orders.eu\t.new", SubjectValidateError::IllegalCharacter),
            ("orders..new", SubjectValidateError::BrokenToken),
            (".orders", SubjectValidateError::BrokenToken),
            ("orders.", SubjectValidateError::BrokenToken),
            ("orders.**", SubjectValidateError::BrokenWildcard),
            ("orders.a*.new", SubjectValidateError::BrokenWildcard),
            ("orders.>.new", SubjectValidateError::BrokenWildcard),
            ("orders.>a", SubjectValidateError::BrokenWildcard),
        ];
        for (subject, expected_err) in subjects {
            let err = Subject::try_from(ByteString::from_static(subject)).unwrap_err();
            assert_eq!(expected_err, err);
        }
    }

    #[test]
    fn literal_matching() {
        let cases = [
            ("orders.eu.new", "orders.eu.new", true),
            ("orders.*.new", "orders.eu.new", true),
            ("orders.*.*", "orders.eu.new", true),
            ("orders.>", "orders.eu.new", true),
            ("orders.>", "orders", false),
            ("orders.*", "orders.eu.new", false),
            ("orders.eu.new", "orders.us.new", false),
            ("*.eu.new", "orders.eu.new", true),
        ];
        for (pattern, literal, expected) in cases {
            let pattern = Subject::from_static(pattern);
            let literal = Subject::try_from(literal).unwrap();
            assert_eq!(expected, pattern.matches(&literal), "{pattern} vs {literal}");
        }
    }

    #[test]
    fn overlap() {
        let cases = [
            ("orders.*.new", "orders.eu.*", true),
            ("orders.>", "orders.eu.new", true),
            ("orders.*", "orders.eu.new", false),
            ("orders.eu.new", "orders.us.new", false),
            ("*.*", "orders.eu", true),
        ];
        for (a, b, expected) in cases {
            let a = Subject::from_static(a);
            let b = Subject::from_static(b);
            assert_eq!(expected, a.overlaps(&b), "{a} vs {b}");
            assert_eq!(expected, b.overlaps(&a), "{b} vs {a}");
        }
    }

    #[test]
    fn subset() {
        let cases = [
            ("orders.eu.new", "orders.*.new", true),
            ("orders.eu.new", "orders.>", true),
            ("orders.*.new", "orders.>", true),
            ("orders.>", "orders.*.new", false),
            ("orders.*.new", "orders.*.*", true),
            ("orders.*.*", "orders.*.new", false),
            ("orders.eu", "orders.eu.new", false),
        ];
        for (sub, sup, expected) in cases {
            let sub = Subject::from_static(sub);
            let sup = Subject::from_static(sup);
            assert_eq!(expected, sub.is_subset_of(&sup), "{sub} vs {sup}");
        }
    }
}
