//! TLS certificate management for interception

pub mod cert_gen;
pub mod store;

pub use cert_gen::CaSubject;
pub use store::TlsStore;
