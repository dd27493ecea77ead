use crate::MobiledeviceError;

/// One muxer frame: a 16-byte little-endian header followed by an XML plist
///
/// The header is `{length (total, including header), version, message type,
/// tag}`, all `u32` little-endian.
pub struct RawPacket {
    pub version: u32,
    pub message: u32,
    pub tag: u32,
    pub plist: plist::Dictionary,
}

impl RawPacket {
    pub const HEADER_SIZE: u32 = 16;

    pub fn new(plist: plist::Dictionary, version: u32, message: u32, tag: u32) -> Self {
        Self {
            version,
            message,
            tag,
            plist,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, MobiledeviceError> {
        let mut payload = Vec::new();
        plist::to_writer_xml(&mut payload, &self.plist)?;

        let mut res = Vec::with_capacity(Self::HEADER_SIZE as usize + payload.len());
        res.extend_from_slice(&(payload.len() as u32 + Self::HEADER_SIZE).to_le_bytes());
        res.extend_from_slice(&self.version.to_le_bytes());
        res.extend_from_slice(&self.message.to_le_bytes());
        res.extend_from_slice(&self.tag.to_le_bytes());
        res.extend_from_slice(&payload);
        Ok(res)
    }
}
