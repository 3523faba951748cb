//! Demultiplexing of inbound datagrams onto per-connection state machines.
//!
//! The [ConnectionTable] owns the mapping from connection quadruple to
//! [Connection] and the insertion-ordered id list used to address
//! connections from the REPL. It is shared between the network thread
//! (inbound segments) and the REPL thread (user writes and closes): lookups
//! take the map read lock, insert and delete take the write lock, and every
//! operation on an individual connection runs under that connection's own
//! lock.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, RwLock};

use crate::debug;
use crate::protocol::headers::{Ipv4Header, TcpHeader};
use crate::protocol::{Connection, Quad, SocketAddr, State};
use crate::{Error, Result, UserError};

/// Shared table of live connections, keyed by quadruple.
///
/// Ids are assigned in insertion order and are never reused; an id whose
/// connection has been removed is a tombstone and is skipped by
/// [ConnectionTable::snapshot].
#[derive(Debug, Default)]
pub struct ConnectionTable {
    inner: RwLock<TableInner>,
}

#[derive(Debug, Default)]
struct TableInner {
    map: HashMap<Quad, Arc<Mutex<Connection>>>,
    ids: Vec<Quad>,
}

impl ConnectionTable {
    /// Creates an empty connection table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes one raw IP datagram read from the device, delivering any
    /// TCP payload to `sink`, and returns the serialized response datagram
    /// to write back, if any.
    ///
    /// Non-TCP datagrams are dropped. A segment for an unknown quadruple
    /// creates a new connection before dispatch.
    ///
    /// # Errors
    ///
    /// Returns [crate::ParseError] for datagrams that cannot be parsed (the
    /// caller drops them) and [crate::ProtocolError] for segments illegal in
    /// the connection's current state (the offending connection has already
    /// been removed from the table). [Error::Io] from `sink` is propagated
    /// untouched.
    pub fn handle_datagram<W: io::Write>(
        &self,
        datagram: &[u8],
        sink: &mut W,
    ) -> Result<Option<Vec<u8>>> {
        let iph = Ipv4Header::try_from(datagram)?;

        if iph.protocol() != Ipv4Header::PROTOCOL_TCP {
            debug!("ignoring non-TCP (protocol {}) packet", iph.protocol());
            return Ok(None);
        }

        let tcph = TcpHeader::try_from(&datagram[iph.header_len()..])?;
        let payload = &datagram[iph.header_len() + tcph.header_len()..];

        debug!(
            "received segment        | src: {}.{}.{}.{}:{}, dst: {}.{}.{}.{}:{}, seq: {}, ack: {}, \
             flags: [{}{}{}{}{}{}], window: {}, checksum: 0x{:04x} (valid: {}), payload: {} bytes",
            iph.src()[0],
            iph.src()[1],
            iph.src()[2],
            iph.src()[3],
            tcph.src_port(),
            iph.dst()[0],
            iph.dst()[1],
            iph.dst()[2],
            iph.dst()[3],
            tcph.dst_port(),
            tcph.seq_number(),
            tcph.ack_number(),
            if tcph.urg() { "U" } else { "" },
            if tcph.ack() { "A" } else { "" },
            if tcph.psh() { "P" } else { "" },
            if tcph.rst() { "R" } else { "" },
            if tcph.syn() { "S" } else { "" },
            if tcph.fin() { "F" } else { "" },
            tcph.window(),
            tcph.checksum(),
            tcph.is_valid_checksum(&iph, payload),
            payload.len(),
        );

        let quad = Quad {
            src: SocketAddr {
                addr: iph.src(),
                port: tcph.src_port(),
            },
            dst: SocketAddr {
                addr: iph.dst(),
                port: tcph.dst_port(),
            },
        };

        let conn = self.lookup_or_create(quad, &tcph);

        // The connection lock is held across payload delivery so segments
        // are delivered upward in arrival order.
        let mut guard = conn.lock().unwrap();

        match guard.handle_segment(&tcph, payload, sink) {
            Ok(response) => {
                let closed = guard.state() == State::CLOSED;
                drop(guard);

                if closed {
                    self.remove(&quad);
                }

                Ok(response.map(|segment| segment.encode(&quad)))
            }
            Err(err @ Error::Protocol(_)) => {
                drop(guard);
                self.remove(&quad);

                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Injects `buf` into connection `id` and returns the serialized data
    /// datagram to write to the device.
    ///
    /// # Errors
    ///
    /// Returns [UserError::UnknownConnection] if `id` does not name a live
    /// connection, and whatever [Connection::write] reports otherwise; the
    /// connection is preserved in every error case.
    pub fn write(&self, id: usize, buf: &[u8]) -> Result<Vec<u8>> {
        let (quad, conn) = self
            .connection(id)
            .ok_or(UserError::UnknownConnection { id })?;

        let segment = conn.lock().unwrap().write(buf)?;

        Ok(segment.encode(&quad))
    }

    /// Initiates a graceful close of connection `id` and returns the
    /// serialized FIN datagram to write to the device.
    ///
    /// # Errors
    ///
    /// Returns [UserError::UnknownConnection] if `id` does not name a live
    /// connection, and whatever [Connection::close] reports otherwise.
    pub fn close(&self, id: usize) -> Result<Vec<u8>> {
        let (quad, conn) = self
            .connection(id)
            .ok_or(UserError::UnknownConnection { id })?;

        let segment = conn.lock().unwrap().close()?;

        Ok(segment.encode(&quad))
    }

    /// Returns the live connections in id order: `(id, quadruple, state)`.
    ///
    /// Tombstoned ids (connections that have been removed) are skipped.
    pub fn snapshot(&self) -> Vec<(usize, Quad, State)> {
        let inner = self.inner.read().unwrap();

        inner
            .ids
            .iter()
            .enumerate()
            .filter_map(|(id, quad)| {
                inner
                    .map
                    .get(quad)
                    .map(|conn| (id, *quad, conn.lock().unwrap().state()))
            })
            .collect()
    }

    /// Returns the connection for the given quadruple, creating and
    /// registering a new one (in LISTEN, initialized from `tcph`) on first
    /// sight.
    fn lookup_or_create(&self, quad: Quad, tcph: &TcpHeader) -> Arc<Mutex<Connection>> {
        {
            let inner = self.inner.read().unwrap();
            if let Some(conn) = inner.map.get(&quad) {
                return Arc::clone(conn);
            }
        }

        let mut inner = self.inner.write().unwrap();

        // Re-check under the write lock: another thread may have inserted
        // between the two acquisitions.
        if let Some(conn) = inner.map.get(&quad) {
            return Arc::clone(conn);
        }

        debug!("[{quad}] new connection (id {})", inner.ids.len());

        let conn = Arc::new(Mutex::new(Connection::initialize(quad, tcph)));

        inner.ids.push(quad);
        inner.map.insert(quad, Arc::clone(&conn));

        conn
    }

    /// Resolves a REPL id to its quadruple and live connection.
    fn connection(&self, id: usize) -> Option<(Quad, Arc<Mutex<Connection>>)> {
        let inner = self.inner.read().unwrap();
        let quad = *inner.ids.get(id)?;
        let conn = Arc::clone(inner.map.get(&quad)?);

        Some((quad, conn))
    }

    /// Deletes the connection for `quad`, leaving its id as a tombstone.
    fn remove(&self, quad: &Quad) {
        let mut inner = self.inner.write().unwrap();

        if inner.map.remove(quad).is_some() {
            debug!(
                "[{quad}] removed connection, active connections remaining: {}",
                inner.map.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParseError;

    const PEER: [u8; 4] = [10, 0, 0, 2];
    const LOCAL: [u8; 4] = [10, 0, 0, 1];
    const PEER_PORT: u16 = 40000;
    const LOCAL_PORT: u16 = 80;

    /// Serializes a peer-to-local datagram around the given TCP header.
    fn datagram(tcph: TcpHeader, payload: &[u8]) -> Vec<u8> {
        let mut ip = Ipv4Header::new(
            PEER,
            LOCAL,
            (TcpHeader::MIN_HEADER_LEN + payload.len()) as u16,
            64,
        );
        ip.set_header_checksum();

        let mut tcp = tcph;
        tcp.set_checksum(&ip, payload);

        let mut buf = ip.to_be_bytes().to_vec();
        buf.extend_from_slice(&tcp.to_be_bytes());
        buf.extend_from_slice(payload);

        buf
    }

    fn syn_datagram(seq: u32, window: u16) -> Vec<u8> {
        syn_datagram_from(PEER_PORT, seq, window)
    }

    fn syn_datagram_from(peer_port: u16, seq: u32, window: u16) -> Vec<u8> {
        let mut tcph = TcpHeader::new(peer_port, LOCAL_PORT, seq, window);
        tcph.set_syn();

        datagram(tcph, &[])
    }

    fn ack_datagram(seq: u32, ack: u32, window: u16) -> Vec<u8> {
        let mut tcph = TcpHeader::new(PEER_PORT, LOCAL_PORT, seq, window);
        tcph.set_ack_number(ack);
        tcph.set_ack();

        datagram(tcph, &[])
    }

    /// Drives the handshake through the table and returns the ISS.
    fn establish(table: &ConnectionTable) -> u32 {
        let mut sink = Vec::new();

        let resp = table
            .handle_datagram(&syn_datagram(1000, 4096), &mut sink)
            .unwrap()
            .expect("SYN must produce a response");

        let syn_ack = TcpHeader::try_from(&resp[20..]).unwrap();
        let iss = syn_ack.seq_number();

        let resp = table
            .handle_datagram(&ack_datagram(1001, iss.wrapping_add(1), 4096), &mut sink)
            .unwrap();
        assert!(resp.is_none());

        iss
    }

    #[test]
    fn non_ipv4_datagram_is_rejected() {
        let table = ConnectionTable::new();
        let mut sink = Vec::new();

        // First nibble 6: an IPv6 datagram.
        let buf = [0x60u8; 40];

        match table.handle_datagram(&buf, &mut sink) {
            Err(Error::Parse(ParseError::NonIpv4 { provided })) => assert_eq!(provided, 6),
            other => panic!("expected NonIpv4, got {other:?}"),
        }

        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn non_tcp_datagram_is_ignored() {
        let table = ConnectionTable::new();
        let mut sink = Vec::new();

        let mut buf = syn_datagram(1000, 4096);
        // Patch the protocol field to UDP; the checksum is not re-verified on
        // the inbound path.
        buf[9] = 17;

        assert!(table.handle_datagram(&buf, &mut sink).unwrap().is_none());
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn handshake_produces_a_well_formed_syn_ack() {
        let table = ConnectionTable::new();
        let mut sink = Vec::new();

        let resp = table
            .handle_datagram(&syn_datagram(1000, 4096), &mut sink)
            .unwrap()
            .expect("SYN must produce a response");

        let iph = Ipv4Header::try_from(&resp[..]).unwrap();
        assert_eq!(iph.version(), 4);
        assert_eq!(iph.ihl(), 5);
        assert_eq!(iph.total_len(), 40);
        assert_eq!(iph.ttl(), 64);
        assert_eq!(iph.flags(), 0b010);
        assert_eq!(iph.protocol(), Ipv4Header::PROTOCOL_TCP);
        assert_eq!(iph.src(), LOCAL);
        assert_eq!(iph.dst(), PEER);
        assert!(iph.is_valid_checksum());

        let tcph = TcpHeader::try_from(&resp[20..]).unwrap();
        assert!(tcph.syn());
        assert!(tcph.ack());
        assert_eq!(tcph.ack_number(), 1001);
        assert_eq!(tcph.src_port(), LOCAL_PORT);
        assert_eq!(tcph.dst_port(), PEER_PORT);
        assert_eq!(tcph.data_offset(), 5);
        assert_eq!(tcph.window(), 1024);
        assert!(tcph.is_valid_checksum(&iph, &[]));

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, 0);
        assert_eq!(snapshot[0].2, State::SYN_RECEIVED);

        // The handshake ACK completes the connection without a response.
        let iss = tcph.seq_number();
        let resp = table
            .handle_datagram(&ack_datagram(1001, iss.wrapping_add(1), 4096), &mut sink)
            .unwrap();
        assert!(resp.is_none());
        assert_eq!(table.snapshot()[0].2, State::ESTABLISHED);
    }

    #[test]
    fn payload_is_delivered_and_acknowledged() {
        let table = ConnectionTable::new();
        let iss = establish(&table);
        let mut sink = Vec::new();

        let mut tcph = TcpHeader::new(PEER_PORT, LOCAL_PORT, 1001, 4096);
        tcph.set_ack_number(iss.wrapping_add(1));
        tcph.set_ack();
        tcph.set_psh();

        let resp = table
            .handle_datagram(&datagram(tcph, b"hello"), &mut sink)
            .unwrap()
            .expect("data must be acknowledged");

        assert_eq!(sink, b"hello");

        let ack = TcpHeader::try_from(&resp[20..]).unwrap();
        assert!(ack.ack());
        assert!(!ack.syn());
        assert_eq!(ack.ack_number(), 1006);
    }

    #[test]
    fn repl_write_emits_a_data_datagram() {
        let table = ConnectionTable::new();
        let iss = establish(&table);

        let out = table.write(0, b"hi").unwrap();

        let iph = Ipv4Header::try_from(&out[..]).unwrap();
        assert_eq!(iph.src(), LOCAL);
        assert_eq!(iph.dst(), PEER);
        assert_eq!(iph.total_len(), 42);

        let tcph = TcpHeader::try_from(&out[20..]).unwrap();
        assert!(tcph.ack());
        assert!(tcph.psh());
        assert_eq!(tcph.seq_number(), iss.wrapping_add(1));
        assert_eq!(&out[40..], b"hi");
        assert!(tcph.is_valid_checksum(&iph, b"hi"));
    }

    #[test]
    fn repl_ids_reference_unknown_connections_as_errors() {
        let table = ConnectionTable::new();

        assert!(matches!(
            table.write(0, b"hi"),
            Err(Error::User(UserError::UnknownConnection { id: 0 }))
        ));
        assert!(matches!(
            table.close(3),
            Err(Error::User(UserError::UnknownConnection { id: 3 }))
        ));
    }

    #[test]
    fn protocol_violation_removes_the_connection_but_keeps_its_id() {
        let table = ConnectionTable::new();
        let mut sink = Vec::new();

        establish(&table);

        // An unexpected RST tears the connection down.
        let mut rst = TcpHeader::new(PEER_PORT, LOCAL_PORT, 1001, 4096);
        rst.set_rst();

        assert!(matches!(
            table.handle_datagram(&datagram(rst, &[]), &mut sink),
            Err(Error::Protocol(_))
        ));
        assert!(table.snapshot().is_empty());

        // A fresh handshake from another peer port gets a new id; id 0 stays
        // a tombstone.
        table
            .handle_datagram(&syn_datagram_from(40001, 5000, 4096), &mut sink)
            .unwrap();

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, 1);

        // The old id no longer resolves.
        assert!(matches!(
            table.write(0, b"hi"),
            Err(Error::User(UserError::UnknownConnection { id: 0 }))
        ));
    }

    #[test]
    fn clean_termination_removes_the_connection() {
        let table = ConnectionTable::new();
        let iss = establish(&table);
        let mut sink = Vec::new();

        // Peer closes its half.
        let mut fin = TcpHeader::new(PEER_PORT, LOCAL_PORT, 1001, 4096);
        fin.set_ack_number(iss.wrapping_add(1));
        fin.set_ack();
        fin.set_fin();

        let resp = table
            .handle_datagram(&datagram(fin, &[]), &mut sink)
            .unwrap()
            .expect("FIN must be acknowledged");

        let ack = TcpHeader::try_from(&resp[20..]).unwrap();
        assert_eq!(ack.ack_number(), 1002);
        assert_eq!(table.snapshot()[0].2, State::CLOSE_WAIT);

        // Local close, then the peer's final ACK; the table entry goes away.
        let out = table.close(0).unwrap();
        let fin_ack = TcpHeader::try_from(&out[20..]).unwrap();
        assert!(fin_ack.fin() && fin_ack.ack());
        assert_eq!(table.snapshot()[0].2, State::LAST_ACK);

        let resp = table
            .handle_datagram(
                &ack_datagram(1002, iss.wrapping_add(2), 4096),
                &mut sink,
            )
            .unwrap();
        assert!(resp.is_none());
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn peer_fin_after_local_close_removes_the_connection() {
        let table = ConnectionTable::new();
        let iss = establish(&table);
        let mut sink = Vec::new();

        table.close(0).unwrap();
        assert_eq!(table.snapshot()[0].2, State::FIN_WAIT_1);

        // The peer acknowledges our FIN and closes its own half in one
        // segment.
        let mut fin = TcpHeader::new(PEER_PORT, LOCAL_PORT, 1001, 4096);
        fin.set_ack_number(iss.wrapping_add(2));
        fin.set_ack();
        fin.set_fin();

        let resp = table
            .handle_datagram(&datagram(fin, &[]), &mut sink)
            .unwrap();
        assert!(resp.is_some());
        assert!(table.snapshot().is_empty());
    }
}
