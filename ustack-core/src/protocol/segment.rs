//! Construction and serialization of outbound TCP segments.

use crate::protocol::Quad;
use crate::protocol::headers::{Ipv4Header, TcpHeader};

/// Time-to-live used on every emitted datagram.
const TTL: u8 = 64;

/// An outbound TCP segment: the header produced by the state machine plus its
/// payload. The enclosing IPv4 header is built at encode time from the
/// connection quadruple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// TCP header of the segment.
    pub tcp: TcpHeader,
    /// Payload of the segment.
    pub payload: Vec<u8>,
}

impl Segment {
    /// Creates a new segment from the given TCP header and payload.
    pub fn new(tcp: TcpHeader, payload: &[u8]) -> Self {
        Self {
            tcp,
            payload: payload.into(),
        }
    }

    /// Serializes the segment into a single IP datagram, addressed back to
    /// the peer of `quad`.
    ///
    /// The IPv4 header is built with version 4, IHL 5, TTL 64, the DF bit,
    /// and a total length of 40 bytes plus the payload; source and
    /// destination are the quadruple's addresses swapped, since `quad` is
    /// stored as received. Both checksums are computed here.
    pub fn encode(&self, quad: &Quad) -> Vec<u8> {
        let mut ip = Ipv4Header::new(
            quad.dst.addr,
            quad.src.addr,
            (TcpHeader::MIN_HEADER_LEN + self.payload.len()) as u16,
            TTL,
        );
        ip.set_header_checksum();

        let mut tcp = self.tcp;
        tcp.set_checksum(&ip, &self.payload);

        let mut datagram =
            Vec::with_capacity(Ipv4Header::MIN_HEADER_LEN + TcpHeader::MIN_HEADER_LEN + self.payload.len());

        datagram.extend_from_slice(&ip.to_be_bytes());
        datagram.extend_from_slice(&tcp.to_be_bytes());
        datagram.extend_from_slice(&self.payload);

        datagram
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SocketAddr;

    fn peer_quad() -> Quad {
        Quad {
            src: SocketAddr {
                addr: [10, 0, 0, 2],
                port: 40000,
            },
            dst: SocketAddr {
                addr: [10, 0, 0, 1],
                port: 80,
            },
        }
    }

    #[test]
    fn encode_addresses_datagram_back_to_peer() {
        let mut tcp = TcpHeader::new(80, 40000, 512, 1024);
        tcp.set_ack();

        let datagram = Segment::new(tcp, b"hi").encode(&peer_quad());

        assert_eq!(datagram.len(), 42);

        let ip = Ipv4Header::try_from(&datagram[..]).unwrap();
        assert_eq!(ip.version(), 4);
        assert_eq!(ip.ihl(), 5);
        assert_eq!(ip.total_len(), 42);
        assert_eq!(ip.ttl(), 64);
        assert_eq!(ip.flags(), 0b010);
        assert_eq!(ip.protocol(), Ipv4Header::PROTOCOL_TCP);
        assert_eq!(ip.src(), [10, 0, 0, 1]);
        assert_eq!(ip.dst(), [10, 0, 0, 2]);
        assert!(ip.is_valid_checksum());

        let parsed = TcpHeader::try_from(&datagram[20..]).unwrap();
        assert_eq!(parsed.src_port(), 80);
        assert_eq!(parsed.dst_port(), 40000);
        assert_eq!(parsed.data_offset(), 5);
        assert!(parsed.is_valid_checksum(&ip, &datagram[40..]));
        assert_eq!(&datagram[40..], b"hi");
    }
}
