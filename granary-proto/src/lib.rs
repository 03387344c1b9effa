//! Sans-IO protocol types for the granary streaming core
//!
//! This crate contains the subjects, names, headers, status codes,
//! message shapes and control API bodies shared by every part of the
//! system. It performs no IO of its own.

pub use self::ack::{AckKind, AckReply, ACK_PREFIX};
pub use self::message::{MessageBase, StoredMessage};
pub use self::name::Name;
pub use self::status_code::StatusCode;
pub use self::subject::Subject;
pub use self::tree::SubjectTree;

pub mod api;
mod ack;
mod api_error;
pub mod headers;
mod message;
mod name;
mod status_code;
mod subject;
mod tree;
mod util;

pub mod error {
    //! Validation and API error types

    pub use super::ack::{AckParseError, AckReplyParseError};
    pub use super::api::RawMessageError;
    pub use super::api_error::{ApiError, ErrorCode, Response};
    pub use super::name::NameValidateError;
    pub use super::status_code::StatusCodeError;
    pub use super::subject::SubjectValidateError;
    pub use super::util::ParseUintError;
}
