#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod net;
pub mod run;
pub mod timer;

#[cfg(test)]
pub(crate) fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}
