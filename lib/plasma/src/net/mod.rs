pub mod connection;
pub mod error;
pub mod framer;
pub mod input;
pub mod retry;
pub mod tcp;
