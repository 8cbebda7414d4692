use crate::error::{ProtocolError, ProxyError, ProxyResult};
use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use std::io::Write;
use std::net::Ipv4Addr;

/// Bytes in the frame header preceding the payload.
pub const HEADER_SIZE: usize = 9;
/// Ceiling on the payload of a single frame.
pub const MAX_PAYLOAD: usize = 8 * 1024;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Opcode {
    /// Open a TCP connection to the addressed peer (client to proxy).
    TcpOpen = 0x01,
    /// Raw bytes over the peer TCP connection.
    TcpData = 0x02,
    /// Close the peer TCP connection.
    TcpClose = 0x03,
    /// Connect outcome: 4-byte big-endian status, zero on success
    /// (proxy to client).
    TcpStatus = 0x04,
    /// A UDP datagram on the data port.
    UdpData = 0x05,
    /// A UDP datagram on the control port.
    UdpCtrl = 0x06,
    /// 10-byte control record (proxy to client).
    System = 0x07,
}

impl Opcode {
    #[inline]
    fn from_u8(value: u8) -> Option<Opcode> {
        match value {
            0x01 => Some(Opcode::TcpOpen),
            0x02 => Some(Opcode::TcpData),
            0x03 => Some(Opcode::TcpClose),
            0x04 => Some(Opcode::TcpStatus),
            0x05 => Some(Opcode::UdpData),
            0x06 => Some(Opcode::UdpCtrl),
            0x07 => Some(Opcode::System),
            _ => None,
        }
    }
}

impl From<Opcode> for u8 {
    #[inline]
    fn from(opcode: Opcode) -> Self {
        opcode as u8
    }
}

/// One message of the client control protocol:
/// `<opcode:u8><addr:u32 be><size:u32 le><payload>`. The address names the
/// peer the payload relates to and is meaningless for some opcodes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub opcode: Opcode,
    pub addr: Ipv4Addr,
    pub payload: Vec<u8>,
}

impl Frame {
    #[inline]
    pub fn new(opcode: Opcode, addr: Ipv4Addr, payload: Vec<u8>) -> Frame {
        Frame {
            opcode,
            addr,
            payload,
        }
    }

    #[inline]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize the frame to the wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(self.encoded_len());

        stream.write_u8(self.opcode.into()).expect("Error writing opcode");
        stream
            .write_u32::<BigEndian>(u32::from(self.addr))
            .expect("Error writing address");
        stream
            .write_u32::<LittleEndian>(self.payload.len() as u32)
            .expect("Error writing size");
        stream.write_all(&self.payload).expect("Error writing payload");

        stream
    }

    /// Decode one frame off the start of `stream`. Returns the frame and
    /// the number of bytes consumed, or None when the stream does not yet
    /// hold a complete frame.
    pub fn decode(stream: &[u8]) -> ProxyResult<Option<(Frame, usize)>> {
        if stream.len() < HEADER_SIZE {
            return Ok(None);
        }

        let opcode = Opcode::from_u8(stream[0])
            .ok_or(ProxyError::Protocol(ProtocolError::UnknownOpcode))?;
        let addr = Ipv4Addr::from(u32::from_be_bytes([
            stream[1], stream[2], stream[3], stream[4],
        ]));
        let size = u32::from_le_bytes([stream[5], stream[6], stream[7], stream[8]]) as usize;

        if size > MAX_PAYLOAD {
            return Err(ProxyError::Protocol(ProtocolError::OversizeFrame));
        }

        if stream.len() < HEADER_SIZE + size {
            return Ok(None);
        }

        let frame = Frame::new(opcode, addr, stream[HEADER_SIZE..HEADER_SIZE + size].to_vec());

        Ok(Some((frame, HEADER_SIZE + size)))
    }
}
