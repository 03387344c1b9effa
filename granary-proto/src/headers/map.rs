use std::collections::{btree_map::Entry, BTreeMap};
use std::{iter, mem, slice};

use super::{HeaderName, HeaderValue};

/// A set of message headers
///
/// `HeaderMap` is a multimap of [`HeaderName`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    headers: BTreeMap<HeaderName, OneOrMany>,
    len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OneOrMany {
    One(HeaderValue),
    Many(Vec<HeaderValue>),
}

impl HeaderMap {
    /// Create an empty `HeaderMap`
    ///
    /// The map will be created without any capacity. This function will not allocate.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            headers: BTreeMap::new(),
            len: 0,
        }
    }

    /// Insert `value` for `name`, replacing any previous values
    pub fn insert(&mut self, name: HeaderName, value: HeaderValue) {
        if let Some(prev) = self.headers.insert(name, OneOrMany::One(value)) {
            self.len -= prev.len();
        }
        self.len += 1;
    }

    /// Append `value` for `name`, keeping any previous values
    pub fn append(&mut self, name: HeaderName, value: HeaderValue) {
        match self.headers.entry(name) {
            Entry::Vacant(vacant) => {
                vacant.insert(OneOrMany::One(value));
            }
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().push(value);
            }
        }
        self.len += 1;
    }

    pub fn remove(&mut self, name: &HeaderName) {
        if let Some(prev) = self.headers.remove(name) {
            self.len -= prev.len();
        }
    }

    /// Get the first value associated with `name`
    #[must_use]
    pub fn get(&self, name: &HeaderName) -> Option<&HeaderValue> {
        self.headers.get(name).map(|values| match values {
            OneOrMany::One(one) => one,
            OneOrMany::Many(many) => &many[0],
        })
    }

    /// Returns the number of keys stored in the map
    ///
    /// This number will be less than or equal to [`HeaderMap::len`].
    #[must_use]
    pub fn keys_len(&self) -> usize {
        self.headers.len()
    }

    /// Returns the number of headers stored in the map
    ///
    /// This number represents the total number of **values** stored in the map.
    /// This number can be greater than or equal to the number of **keys** stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the map contains no elements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Clear the map, removing all key-value pairs. Keeps the allocated memory for reuse
    pub fn clear(&mut self) {
        self.headers.clear();
        self.len = 0;
    }

    pub fn iter(
        &self,
    ) -> impl DoubleEndedIterator<Item = (&'_ HeaderName, impl Iterator<Item = &'_ HeaderValue>)>
    {
        self.headers
            .iter()
            .map(|(name, value)| (name, value.iter()))
    }
}

impl FromIterator<(HeaderName, HeaderValue)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (HeaderName, HeaderValue)>>(iter: I) -> Self {
        let mut this = Self::new();
        this.extend(iter);
        this
    }
}

impl Extend<(HeaderName, HeaderValue)> for HeaderMap {
    fn extend<T: IntoIterator<Item = (HeaderName, HeaderValue)>>(&mut self, iter: T) {
        iter.into_iter().for_each(|(name, value)| {
            self.append(name, value);
        });
    }
}

impl OneOrMany {
    fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(vec) => vec.len(),
        }
    }

    fn push(&mut self, item: HeaderValue) {
        match self {
            Self::One(current_item) => {
                let current_item =
                    mem::replace(current_item, HeaderValue::from_static("replacing"));
                *self = Self::Many(vec![current_item, item]);
            }
            Self::Many(vec) => {
                debug_assert!(!vec.is_empty(), "OneOrMany can't be empty");
                vec.push(item);
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = &'_ HeaderValue> {
        enum Either<'a> {
            A(iter::Once<&'a HeaderValue>),
            B(slice::Iter<'a, HeaderValue>),
        }

        impl<'a> Iterator for Either<'a> {
            type Item = &'a HeaderValue;

            fn next(&mut self) -> Option<Self::Item> {
                match self {
                    Self::A(a) => a.next(),
                    Self::B(b) => b.next(),
                }
            }

            fn size_hint(&self) -> (usize, Option<usize>) {
                match self {
                    Self::A(a) => a.size_hint(),
                    Self::B(b) => b.size_hint(),
                }
            }
        }

        impl DoubleEndedIterator for Either<'_> {
            fn next_back(&mut self) -> Option<Self::Item> {
                match self {
                    Self::A(a) => a.next_back(),
                    Self::B(b) => b.next_back(),
                }
            }
        }

        match self {
            Self::One(one) => Either::A(iter::once(one)),
            Self::Many(many) => Either::B(many.iter()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::headers::{HeaderName, HeaderValue};

    use super::HeaderMap;

    #[test]
    fn manual() {
        let mut headers = HeaderMap::new();
        headers.append(HeaderName::MESSAGE_ID, HeaderValue::from_static("abcd"));
        headers.append(HeaderName::SEQUENCE, HeaderValue::from_static("1"));
        headers.append(HeaderName::MESSAGE_ID, HeaderValue::from_static("1234"));
        headers.append(HeaderName::TIMESTAMP, HeaderValue::from_static("0"));
        headers.remove(&HeaderName::TIMESTAMP);

        assert_eq!(3, headers.len());
        assert_eq!(2, headers.keys_len());
        assert_eq!(
            Some(&HeaderValue::from_static("abcd")),
            headers.get(&HeaderName::MESSAGE_ID)
        );
        assert_eq!(None, headers.get(&HeaderName::TIMESTAMP));
    }

    #[test]
    fn insert_replaces() {
        let mut headers = HeaderMap::new();
        headers.append(HeaderName::MESSAGE_ID, HeaderValue::from_static("abcd"));
        headers.append(HeaderName::MESSAGE_ID, HeaderValue::from_static("1234"));
        headers.insert(HeaderName::MESSAGE_ID, HeaderValue::from_static("wxyz"));

        assert_eq!(1, headers.len());
        assert_eq!(
            Some(&HeaderValue::from_static("wxyz")),
            headers.get(&HeaderName::MESSAGE_ID)
        );
    }

    #[test]
    fn collect() {
        let headers = [
            (HeaderName::MESSAGE_ID, HeaderValue::from_static("abcd")),
            (HeaderName::SEQUENCE, HeaderValue::from_static("1")),
            (HeaderName::MESSAGE_ID, HeaderValue::from_static("1234")),
        ]
        .into_iter()
        .collect::<HeaderMap>();

        assert_eq!(3, headers.len());
        assert_eq!(2, headers.keys_len());

        let raw_headers = headers
            .iter()
            .map(|(name, values)| (name.clone(), values.cloned().collect::<Vec<_>>()))
            .collect::<Vec<_>>();
        assert_eq!(
            [
                (
                    HeaderName::MESSAGE_ID,
                    vec![
                        HeaderValue::from_static("abcd"),
                        HeaderValue::from_static("1234")
                    ]
                ),
                (HeaderName::SEQUENCE, vec![HeaderValue::from_static("1")]),
            ]
            .as_slice(),
            raw_headers.as_slice(),
        );
    }
}
