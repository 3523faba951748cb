use super::Ipv4Header;
use crate::checksum;
use crate::{Error, ParseError};

/// TCP Segment Header.
///
/// RFC 793 (3.1)
///
/// ```text
///   0                   1                   2                   3
///     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |          Source Port          |       Destination Port        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                        Sequence Number                        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                    Acknowledgment Number                      |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |  Data |           |U|A|P|R|S|F|                               |
///    | Offset| Reserved  |R|C|S|S|Y|I|            Window             |
///    |       |           |G|K|H|T|N|N|                               |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |           Checksum            |         Urgent Pointer        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                    Options                    |    Padding    |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                             data                              |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Options are never parsed: the payload cursor skips to `data_offset * 4`
/// and headers are always emitted with a data offset of 5.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// The source port number.
    src_port: u16,
    /// The destination port number.
    dst_port: u16,
    /// The sequence number of the first data octet in this segment (except
    /// when SYN is present). If SYN is present the sequence number is the
    /// initial sequence number (ISN) and the first data octet is ISN+1.
    seq_number: u32,
    /// If the ACK control bit is set this field contains the value of the
    /// next sequence number the sender of the segment is expecting to
    /// receive.
    ack_number: u32,
    /// The data offset (4 bits) indicates the number of 32-bit words in the
    /// TCP header.
    ///
    /// The reserved 6 bits are for future use (according to RFC 793).
    ///
    /// The control bits (6 bits) from left to right:
    ///
    /// ```text
    ///    URG:  Urgent Pointer field significant
    ///    ACK:  Acknowledgment field significant
    ///    PSH:  Push Function
    ///    RST:  Reset the connection
    ///    SYN:  Synchronize sequence numbers
    ///    FIN:  No more data from sender
    /// ```
    offset_and_control_bits: u16,
    /// The number of data octets beginning with the one indicated in the
    /// acknowledgment field which the sender of this segment is willing to
    /// accept.
    window: u16,
    /// The checksum field is the 16-bit one's complement of the one's
    /// complement sum of all 16-bit words in the pseudo header, header, and
    /// text.
    checksum: u16,
    /// The current value of the urgent pointer as a positive offset from the
    /// sequence number in this segment.
    urgent_pointer: u16,
}

impl TcpHeader {
    /// Length of the option-less TCP header in bytes.
    pub const MIN_HEADER_LEN: usize = 20;

    /// Minimum data offset of a TCP header, in 32-bit words.
    pub const MIN_DATA_OFFSET: u8 = 5;

    /// Creates a new option-less TCP header with the specified source and
    /// destination ports, sequence number, and window size. No control bits
    /// are set.
    pub fn new(src_port: u16, dst_port: u16, seq_number: u32, window: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq_number,
            ack_number: 0,
            // Data offset = 5, reserved and control bits clear.
            offset_and_control_bits: 0b0101_000000_000000,
            window,
            checksum: 0,
            urgent_pointer: 0,
        }
    }

    /// Returns the `source port` field of the TCP header.
    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    /// Returns the `destination port` field of the TCP header.
    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    /// Returns the `sequence number` field of the TCP header.
    pub fn seq_number(&self) -> u32 {
        self.seq_number
    }

    /// Returns the `acknowledgment number` field of the TCP header.
    pub fn ack_number(&self) -> u32 {
        self.ack_number
    }

    /// Sets the `acknowledgment number` field of the TCP header.
    pub fn set_ack_number(&mut self, ack: u32) {
        self.ack_number = ack;
    }

    /// Returns the `data offset` field of the TCP header, in 32-bit words.
    ///
    /// To get the header length in bytes, use [TcpHeader::header_len].
    pub fn data_offset(&self) -> u8 {
        // Stored in the higher 4 bits.
        (self.offset_and_control_bits >> 12) as u8
    }

    /// Returns the `reserved` field (6 bits) of the TCP header.
    pub fn reserved(&self) -> u8 {
        ((self.offset_and_control_bits >> 6) & 0x3F) as u8
    }

    /// Returns `true` if the URG (Urgent) control bit is set.
    pub fn urg(&self) -> bool {
        // Stored at the 5th bit.
        (self.offset_and_control_bits >> 5) & 1 == 1
    }

    /// Sets the URG (Urgent) control bit.
    pub fn set_urg(&mut self) {
        self.offset_and_control_bits |= 1 << 5;
    }

    /// Returns `true` if the ACK (Acknowledgment) control bit is set.
    pub fn ack(&self) -> bool {
        // Stored at the 4th bit.
        (self.offset_and_control_bits >> 4) & 1 == 1
    }

    /// Sets the ACK (Acknowledgment) control bit.
    pub fn set_ack(&mut self) {
        self.offset_and_control_bits |= 1 << 4;
    }

    /// Returns `true` if the PSH (Push) control bit is set.
    pub fn psh(&self) -> bool {
        // Stored at the 3rd bit.
        (self.offset_and_control_bits >> 3) & 1 == 1
    }

    /// Sets the PSH (Push) control bit.
    pub fn set_psh(&mut self) {
        self.offset_and_control_bits |= 1 << 3;
    }

    /// Returns `true` if the RST (Reset) control bit is set.
    pub fn rst(&self) -> bool {
        // Stored at the 2nd bit.
        (self.offset_and_control_bits >> 2) & 1 == 1
    }

    /// Sets the RST (Reset) control bit.
    pub fn set_rst(&mut self) {
        self.offset_and_control_bits |= 1 << 2;
    }

    /// Returns `true` if the SYN (Synchronize) control bit is set.
    pub fn syn(&self) -> bool {
        // Stored at the 1st bit.
        (self.offset_and_control_bits >> 1) & 1 == 1
    }

    /// Sets the SYN (Synchronize) control bit.
    pub fn set_syn(&mut self) {
        self.offset_and_control_bits |= 1 << 1;
    }

    /// Returns `true` if the FIN (Finish) control bit is set.
    pub fn fin(&self) -> bool {
        // Stored at the LSB.
        self.offset_and_control_bits & 1 == 1
    }

    /// Sets the FIN (Finish) control bit.
    pub fn set_fin(&mut self) {
        self.offset_and_control_bits |= 1;
    }

    /// Returns the `window` field of the TCP header.
    pub fn window(&self) -> u16 {
        self.window
    }

    /// Returns the `checksum` field of the TCP header.
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Computes and updates the `checksum` field for the TCP header.
    pub fn set_checksum(&mut self, ip_header: &Ipv4Header, payload: &[u8]) {
        self.checksum = self.compute_checksum(ip_header, payload);
    }

    /// Returns `true` if the stored TCP checksum is valid for the given IPv4
    /// header and payload.
    pub fn is_valid_checksum(&self, ip_header: &Ipv4Header, payload: &[u8]) -> bool {
        self.checksum == self.compute_checksum(ip_header, payload)
    }

    /// Returns the `urgent pointer` field of the TCP header.
    pub fn urgent_pointer(&self) -> u16 {
        self.urgent_pointer
    }

    /// Returns the length of the TCP header in bytes as declared by the data
    /// offset, including any options.
    ///
    /// The segment payload begins at this offset.
    pub fn header_len(&self) -> usize {
        usize::from(self.data_offset()) * 4
    }

    /// Returns the computed checksum of the TCP header.
    ///
    /// The checksum covers a 96-bit pseudo header conceptually prefixed to
    /// the TCP header:
    ///
    /// ```text
    ///        +--------+--------+--------+--------+
    ///        |           Source Address          |
    ///        +--------+--------+--------+--------+
    ///        |         Destination Address       |
    ///        +--------+--------+--------+--------+
    ///        |  zero  |  PTCL  |    TCP Length   |
    ///        +--------+--------+--------+--------+
    /// ```
    ///
    /// followed by the header (with the checksum field zeroed) and the
    /// payload, padded on the right with a zero octet if of odd length.
    pub fn compute_checksum(&self, ip_header: &Ipv4Header, payload: &[u8]) -> u16 {
        let mut pseudo_header = [0u8; 12];

        pseudo_header[0..4].copy_from_slice(&ip_header.src());
        pseudo_header[4..8].copy_from_slice(&ip_header.dst());
        pseudo_header[8] = 0;
        pseudo_header[9] = ip_header.protocol();

        let tcp_len = (Self::MIN_HEADER_LEN + payload.len()) as u16;
        pseudo_header[10..12].copy_from_slice(&tcp_len.to_be_bytes());

        let mut raw_header = self.to_be_bytes();

        // Checksum field must be 0 for computation.
        raw_header[16] = 0x00;
        raw_header[17] = 0x00;

        let mut sum = checksum::sum_words(&pseudo_header);
        sum = checksum::add1s(sum, checksum::sum_words(&raw_header));
        sum = checksum::add1s(sum, checksum::sum_words(payload));

        !sum
    }

    /// Returns the memory representation of the TCP header as a byte array in
    /// big-endian (network) byte order.
    ///
    /// Only the 20-byte option-less base header is emitted.
    #[allow(clippy::wrong_self_convention)]
    pub fn to_be_bytes(&self) -> [u8; Self::MIN_HEADER_LEN] {
        let mut raw_header = [0u8; Self::MIN_HEADER_LEN];

        raw_header[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        raw_header[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        raw_header[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        raw_header[8..12].copy_from_slice(&self.ack_number.to_be_bytes());
        raw_header[12..14].copy_from_slice(&self.offset_and_control_bits.to_be_bytes());
        raw_header[14..16].copy_from_slice(&self.window.to_be_bytes());
        raw_header[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        raw_header[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());

        raw_header
    }
}

impl TryFrom<&[u8]> for TcpHeader {
    type Error = Error;

    fn try_from(header_raw: &[u8]) -> Result<Self, Self::Error> {
        if header_raw.len() < Self::MIN_HEADER_LEN {
            return Err(Error::Parse(ParseError::Truncated {
                provided: header_raw.len(),
                min: Self::MIN_HEADER_LEN,
            }));
        }

        let offset_and_control_bits = u16::from_be_bytes([header_raw[12], header_raw[13]]);
        let data_offset = (offset_and_control_bits >> 12) as u8;

        if data_offset < Self::MIN_DATA_OFFSET {
            return Err(Error::Parse(ParseError::InvalidDataOffset {
                provided: data_offset,
            }));
        }

        // The buffer must hold the full declared header so the payload cursor
        // can be advanced past any options.
        if header_raw.len() < usize::from(data_offset) * 4 {
            return Err(Error::Parse(ParseError::Truncated {
                provided: header_raw.len(),
                min: usize::from(data_offset) * 4,
            }));
        }

        Ok(Self {
            src_port: u16::from_be_bytes([header_raw[0], header_raw[1]]),
            dst_port: u16::from_be_bytes([header_raw[2], header_raw[3]]),
            seq_number: u32::from_be_bytes([
                header_raw[4],
                header_raw[5],
                header_raw[6],
                header_raw[7],
            ]),
            ack_number: u32::from_be_bytes([
                header_raw[8],
                header_raw[9],
                header_raw[10],
                header_raw[11],
            ]),
            offset_and_control_bits,
            window: u16::from_be_bytes([header_raw[14], header_raw[15]]),
            checksum: u16::from_be_bytes([header_raw[16], header_raw[17]]),
            urgent_pointer: u16::from_be_bytes([header_raw[18], header_raw[19]]),
        })
    }
}
