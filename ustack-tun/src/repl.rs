//! Line-oriented REPL for inspecting connections and driving user-side
//! writes and closes.
//!
//! Runs on its own thread, blocking on standard input. It shares the
//! connection table and the device with the network loop; both are passed in
//! as explicit handles.

use std::io::{self, BufRead, Write};
use std::process;
use std::sync::Arc;

use ustack_core::error;
use ustack_core::protocol::ConnectionTable;

use crate::tun_tap::Tun;

/// Runs the REPL until standard input is closed or fails.
///
/// Exits the process on a standard-input read failure; all command errors
/// are printed to stderr and control returns to the prompt.
pub fn run(tun: Arc<Tun>, connections: Arc<ConnectionTable>) {
    let stdin = io::stdin();
    let mut line = String::new();

    loop {
        print!("> ");
        let _ = io::stdout().flush();

        line.clear();
        match stdin.lock().read_line(&mut line) {
            // Standard input was closed; the network loop keeps running.
            Ok(0) => return,
            Ok(_) => {}
            Err(err) => {
                error!("failed to read from stdin: {err}");
                process::exit(1);
            }
        }

        dispatch(line.trim(), &tun, &connections);
    }
}

fn dispatch(line: &str, tun: &Tun, connections: &ConnectionTable) {
    if line == "c" || line == "connections" {
        inspect(connections);
        return;
    }

    if line.starts_with("write") {
        let words: Vec<&str> = line.split(' ').collect();

        if words.len() != 3 {
            eprintln!("usage: write <conn_id> <text>");
            return;
        }

        let Ok(conn_id) = words[1].parse::<usize>() else {
            eprintln!("conn_id must be a number");
            return;
        };

        match connections.write(conn_id, words[2].as_bytes()) {
            Ok(datagram) => {
                if let Err(err) = tun.send(&datagram) {
                    eprintln!("failed to write TCP data on the wire: {err}");
                }
            }
            Err(err) => {
                eprintln!("failed to send data: {err}");
            }
        }
    }

    if line.starts_with("close") {
        let words: Vec<&str> = line.split(' ').collect();

        if words.len() != 2 {
            eprintln!("usage: close <conn_id>");
            return;
        }

        let Ok(conn_id) = words[1].parse::<usize>() else {
            eprintln!("conn_id must be a number");
            return;
        };

        match connections.close(conn_id) {
            Ok(datagram) => {
                if let Err(err) = tun.send(&datagram) {
                    eprintln!("failed to write TCP data on the wire: {err}");
                }
            }
            Err(err) => {
                eprintln!("failed to close connection: {err}");
            }
        }
    }
}

/// Prints the connection table: id, quadruple, and state of every live
/// connection in insertion order.
fn inspect(connections: &ConnectionTable) {
    let snapshot = connections.snapshot();

    if snapshot.is_empty() {
        println!("no open connections");
        return;
    }

    println!("{:<8} {:<44} {}", "conn_id", "connection", "state");
    for (id, quad, state) in snapshot {
        println!("{id:<8} {:<44} {state}", quad.to_string());
    }
}
