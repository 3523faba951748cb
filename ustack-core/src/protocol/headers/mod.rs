//! Parsing and serialization of IPv4 and TCP headers.

/// IPv4 header parsing and serialization.
pub mod ipv4;
pub use ipv4::Ipv4Header;

/// TCP header parsing and serialization.
pub mod tcp;
pub use tcp::TcpHeader;
