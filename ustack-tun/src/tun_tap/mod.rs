//! TUN virtual network device support.

pub mod tun;
pub use tun::{MTU_SIZE, Tun};
