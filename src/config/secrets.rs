//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers holding a [`super::Config`] can
//! expose the store URL only at the point of connecting.

pub use secrecy::{ExposeSecret, SecretString};
