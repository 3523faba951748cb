//! TUN/TAP provides packet reception and transmission for user space
//! programs.
//!
//! It can be seen as a simple Point-to-Point or Ethernet device, which,
//! instead of receiving packets from physical media, receives them from the
//! user space program and instead of sending packets via physical media
//! writes them to the user space program.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::{mem, ptr};

use ustack_core::Result;

use crate::errno;

/// Maximum Transmission Unit (`MTU`) for the TUN interface.
///
/// The device is opened with `IFF_NO_PI`, so reads carry no packet-info
/// prefix: one call returns one raw IP datagram.
pub const MTU_SIZE: usize = 1500;

/// TUN (network TUNnel) device.
///
/// A virtual network device that acts as a software loopback for transferring
/// IP packets between user space and the kernel, operating at layer 3 of the
/// OSI model.
#[derive(Debug)]
pub struct Tun {
    fd: File,
    name: String,
}

impl Tun {
    /// Opens the TUN device with the given interface name, in layer-3 mode
    /// and without packet information.
    ///
    /// The host is expected to have created the interface and routed the
    /// target prefix to it out of band.
    ///
    /// # Errors
    ///
    /// Returns an error if the TUN device cannot be opened, for example, due
    /// to the absence of the `CAP_NET_ADMIN` privilege.
    pub fn open(name: &str) -> Result<Self> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let mut ifr: libc::ifreq = unsafe { mem::zeroed() };

        // IFF_TUN   - TUN device (no Ethernet headers)
        // IFF_NO_PI - Do not provide packet information
        let flags = libc::IFF_TUN | libc::IFF_NO_PI;

        // The interface name must fit the fixed-size ifreq field, including
        // its trailing NUL.
        if name.len() >= ifr.ifr_name.len() {
            return Err(errno!("interface name '{name}' too long"));
        }

        unsafe {
            ptr::copy_nonoverlapping(
                name.as_ptr(),
                ifr.ifr_name.as_mut_ptr() as *mut u8,
                name.len(),
            );
        }

        ifr.ifr_ifru.ifru_flags = flags as i16;

        if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TUNSETIFF, &ifr) } == -1 {
            return Err(errno!("failed to attach to TUN interface '{name}'"));
        }

        Ok(Self {
            fd,
            name: name.to_string(),
        })
    }

    /// Returns the interface name of the `TUN`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receives one IP datagram from the `TUN`.
    ///
    /// This call blocks until a datagram is available for reading. The caller
    /// must provide a buffer of at least `MTU_SIZE` bytes.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        (&self.fd).read(buf).map_err(|err| err.into())
    }

    /// Sends one complete IP datagram (IP header, TCP header, payload) to
    /// the `TUN`.
    ///
    /// Many errors are handled silently by the OS kernel, which may lead to
    /// dropped packets. Although the packet might appear successfully sent,
    /// it could be discarded by the kernel due to issues like checksum
    /// validation failure or unassigned destination addresses.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        (&self.fd).write(buf).map_err(|err| err.into())
    }
}
