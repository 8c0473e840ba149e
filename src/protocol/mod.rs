//! Wire protocol handling for the observed feed

pub mod decoder;

pub use decoder::{decode, decode_str};
