//! Authentication policies: bearer tokens from a pluggable credential (with `401` challenge
//! answering), and HMAC request signing configured from a connection string.

pub mod bearer;
pub mod challenge;
pub mod connection_string;
pub mod hmac;
pub mod token;

pub use self::{bearer::*, challenge::*, connection_string::*, hmac::*, token::*};
