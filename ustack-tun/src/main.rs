//! TUN-backed driver for the user-space TCP stack.
//!
//! Reads raw IP datagrams from a TUN device one at a time, feeds them
//! through the connection demultiplexer, and writes any response datagram
//! back to the device. A REPL on a second thread inspects connections and
//! injects user-side writes and closes through the same shared table.

use std::io;
use std::process;
use std::sync::Arc;
use std::thread;

use ustack_core::protocol::ConnectionTable;
use ustack_core::{Error, debug, error, info, warn};

mod repl;
mod tun_tap;

use tun_tap::{MTU_SIZE, Tun};

/// Interface name used when none is given on the command line.
const DEFAULT_IFACE: &str = "tun_tcp";

/// Creates a [ustack_core::Error::Io] with a message prefixed to the `errno`
/// value.
macro_rules! errno {
    ($($arg:tt)+) => {{
        let errno = ::std::io::Error::last_os_error();
        let prefix = format!($($arg)+);
        ustack_core::Error::Io(::std::io::Error::new(errno.kind(), format!("{prefix}: {errno}")))
    }};
}
pub(crate) use errno;

fn main() {
    let iface = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_IFACE.to_string());

    let tun = Tun::open(&iface).unwrap_or_else(|err| {
        error!("failed to open TUN interface: {err}");
        process::exit(1);
    });

    info!("attached to interface {}", tun.name());

    let tun = Arc::new(tun);
    let connections = Arc::new(ConnectionTable::new());

    {
        let tun = Arc::clone(&tun);
        let connections = Arc::clone(&connections);

        thread::spawn(move || repl::run(tun, connections));
    }

    packet_loop(&tun, &connections);
}

/// Runs the network loop: read one datagram, dispatch it, write the response
/// before the next read.
///
/// Parse failures and protocol violations are local to one datagram or one
/// connection; only device-level I/O failures terminate the process.
fn packet_loop(tun: &Tun, connections: &ConnectionTable) -> ! {
    let mut buf = [0u8; MTU_SIZE];

    loop {
        let nbytes = tun.recv(&mut buf[..]).unwrap_or_else(|err| {
            error!("failed to read from TUN interface: {err}");
            process::exit(1);
        });

        match connections.handle_datagram(&buf[..nbytes], &mut io::stdout()) {
            Ok(Some(response)) => {
                if let Err(err) = tun.send(&response) {
                    error!("failed to write to TUN interface: {err}");
                    process::exit(1);
                }
            }
            Ok(None) => {}
            Err(Error::Parse(err)) => {
                debug!("dropping datagram: {err}");
            }
            Err(Error::Protocol(err)) => {
                warn!("{err}");
            }
            Err(err) => {
                error!("failed to process datagram: {err}");
                process::exit(1);
            }
        }
    }
}
