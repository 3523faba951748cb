//! A minimal, learning-grade implementation of the Transmission Control
//! Protocol (TCP) over IPv4, driven by raw datagrams from a TUN device,
//! loosely based on [RFC 793].
//!
//! This project is experimental and not intended for production use: there is
//! no retransmission, no congestion control, no out-of-order reassembly, and
//! TCP options are skipped rather than parsed.
//!
//! [RFC 793]: https://www.rfc-editor.org/rfc/rfc793

#![deny(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod log;

pub mod checksum;

pub mod protocol;

pub mod error;
pub use error::{Error, ParseError, ProtocolError, Result, UserError};
