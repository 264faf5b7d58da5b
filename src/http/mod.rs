//! HTTP wire handling: receive buffer, incremental parser, response
//! serialization and multipart decoding.

pub mod buffer;
pub mod multipart;
pub mod request;
pub mod response;

pub use buffer::SocketBuffer;
pub use request::{ParseError, Request};
pub use response::ResponseStream;
