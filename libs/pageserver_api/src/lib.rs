#![deny(unsafe_code)]
#![deny(clippy::undocumented_unsafe_blocks)]

pub mod key;
pub mod models;
