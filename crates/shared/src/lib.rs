pub mod connection;
pub mod domain;
pub mod error;
pub mod protocol;
