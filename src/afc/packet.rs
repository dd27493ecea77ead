//! AFC frame layout
//!
//! Every AFC message starts with a 40-byte header of five little-endian
//! words: magic, total length, header length (header plus the operation's
//! inline arguments), packet number, and opcode. File data, when present,
//! follows the header payload.

use crate::MobiledeviceError;

use super::opcode::AfcOpcode;

#[derive(Clone, Copy, Debug)]
pub struct AfcPacketHeader {
    pub magic: u64,
    pub entire_len: u64,
    pub header_payload_len: u64,
    pub packet_num: u64,
    pub operation: AfcOpcode,
}

impl AfcPacketHeader {
    pub const LEN: usize = 40;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let words = [
            self.magic,
            self.entire_len,
            self.header_payload_len,
            self.packet_num,
            self.operation as u64,
        ];
        let mut out = [0u8; Self::LEN];
        for (slot, word) in out.chunks_exact_mut(8).zip(words) {
            slot.copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}

impl TryFrom<&[u8]> for AfcPacketHeader {
    type Error = MobiledeviceError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != Self::LEN {
            return Err(MobiledeviceError::ProtocolViolation(format!(
                "afc header must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let word = |i: usize| u64::from_le_bytes(bytes[i * 8..(i + 1) * 8].try_into().unwrap());

        let magic = word(0);
        if magic != super::MAGIC {
            return Err(MobiledeviceError::InvalidAfcMagic);
        }
        let operation =
            AfcOpcode::try_from(word(4)).map_err(|_| MobiledeviceError::UnknownAfcOpcode)?;

        Ok(Self {
            magic,
            entire_len: word(1),
            header_payload_len: word(2),
            packet_num: word(3),
            operation,
        })
    }
}

#[derive(Clone, Debug)]
pub struct AfcPacket {
    pub header: AfcPacketHeader,
    pub header_payload: Vec<u8>,
    pub payload: Vec<u8>,
}

impl AfcPacket {
    /// Frames one request; the header lengths are derived from the payloads
    pub fn request(
        operation: AfcOpcode,
        packet_num: u64,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Self {
        let header_payload_len = (header_payload.len() + AfcPacketHeader::LEN) as u64;
        Self {
            header: AfcPacketHeader {
                magic: super::MAGIC,
                entire_len: header_payload_len + payload.len() as u64,
                header_payload_len,
                packet_num,
                operation,
            },
            header_payload,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.entire_len as usize);
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.header_payload);
        out.extend_from_slice(&self.payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let packet = AfcPacket::request(AfcOpcode::FileOpen, 3, b"path".to_vec(), Vec::new());
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), AfcPacketHeader::LEN + 4);

        let header = AfcPacketHeader::try_from(&bytes[..AfcPacketHeader::LEN]).unwrap();
        assert_eq!(header.operation, AfcOpcode::FileOpen);
        assert_eq!(header.packet_num, 3);
        assert_eq!(header.header_payload_len as usize, AfcPacketHeader::LEN + 4);
        assert_eq!(header.entire_len, header.header_payload_len);
    }

    #[test]
    fn lengths_account_for_file_data() {
        let packet = AfcPacket::request(AfcOpcode::Write, 0, vec![0; 8], vec![1; 100]);
        assert_eq!(
            packet.header.entire_len,
            packet.header.header_payload_len + 100
        );
        assert_eq!(packet.to_bytes().len() as u64, packet.header.entire_len);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = [0u8; AfcPacketHeader::LEN];
        match AfcPacketHeader::try_from(&bytes[..]) {
            Err(MobiledeviceError::InvalidAfcMagic) => {}
            other => panic!("expected InvalidAfcMagic, got {other:?}"),
        }
    }
}
