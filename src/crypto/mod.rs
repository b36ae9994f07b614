//! Cryptographic primitives: keyed token hashing and slow password hashing.

mod password;
mod token;

pub use password::{PasswordConfig, PasswordHasher};
pub use token::{TOKEN_BYTES, TokenHasher, constant_time_eq, generate_secure_token};
