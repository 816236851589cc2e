//! Utility helpers for the proxy

pub mod io;

pub use io::PrefixedStream;
