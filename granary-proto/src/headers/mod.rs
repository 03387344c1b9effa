//! Message headers
//!
//! Headers are an ordered multimap of case-insensitive names to values.
//! A number of names carry semantic meaning for the streaming core and
//! are exposed as constants on [`HeaderName`].

pub use self::map::HeaderMap;
pub use self::name::{HeaderName, HeaderNameValidateError};
pub use self::value::{HeaderValue, HeaderValueValidateError};

mod map;
mod name;
mod value;
