//! Authentication building blocks: signed session tokens and TOTP codes.

pub mod token;
pub mod totp;

pub use token::{TokenService, UserInfo};
