//! AFC (Apple File Conduit) client
//!
//! The on-device filesystem service. Only the operations the backup needs
//! are implemented: open, advisory lock, read, close. The sync lock file
//! `/com.apple.itunes.lock_sync` is the one file backups care about.

use log::{debug, warn};

use crate::{DeviceConnection, DeviceService, MobiledeviceError};

pub mod errors;
pub mod opcode;
pub mod packet;

use errors::AfcError;
use opcode::{AfcFopenMode, AfcLockType, AfcOpcode};
use packet::{AfcPacket, AfcPacketHeader};

/// The magic number used in AFC protocol communications
pub const MAGIC: u64 = 0x4141504c36414643;

/// Maximum transfer size for file reads (64KB)
const MAX_TRANSFER: u64 = 64 * 1024;

/// Client for the AFC service
#[derive(Debug)]
pub struct AfcClient {
    /// The underlying device connection
    pub connection: DeviceConnection,
    package_number: u64,
}

impl DeviceService for AfcClient {
    fn service_name() -> std::borrow::Cow<'static, str> {
        std::borrow::Cow::Borrowed("com.apple.afc")
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, MobiledeviceError> {
        Ok(Self::new(connection))
    }
}

impl AfcClient {
    pub fn new(connection: DeviceConnection) -> Self {
        Self {
            connection,
            package_number: 0,
        }
    }

    async fn request(
        &mut self,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<AfcPacket, MobiledeviceError> {
        let packet = AfcPacket::request(operation, self.package_number, header_payload, payload);
        self.package_number += 1;
        self.connection.send_raw(&packet.to_bytes()).await?;
        self.read_response().await
    }

    /// Reads one reply frame, converting status packets into errors
    async fn read_response(&mut self) -> Result<AfcPacket, MobiledeviceError> {
        let header_bytes = self.connection.read_raw(AfcPacketHeader::LEN).await?;
        let header = AfcPacketHeader::try_from(header_bytes.as_slice())?;
        debug!("afc reply header: {header:?}");

        let argument_len = (header.header_payload_len as usize).saturating_sub(AfcPacketHeader::LEN);
        let header_payload = self.connection.read_raw(argument_len).await?;

        let data_len = (header.entire_len as usize).saturating_sub(header.header_payload_len as usize);
        let payload = if data_len == 0 {
            Vec::new()
        } else {
            self.connection.read_raw(data_len).await?
        };

        if header.operation == AfcOpcode::Status {
            let code = header_payload
                .get(..8)
                .map(|b| u64::from_le_bytes(b.try_into().unwrap()));
            match code {
                Some(code) => {
                    let status = AfcError::from(code);
                    if status != AfcError::Success {
                        return Err(MobiledeviceError::Afc(status));
                    }
                }
                None => {
                    warn!("AFC returned a status packet without a code");
                    return Err(MobiledeviceError::UnexpectedResponse);
                }
            }
        }

        Ok(AfcPacket {
            header,
            header_payload,
            payload,
        })
    }

    /// Opens a file on the device, returning its descriptor
    pub async fn open(
        &mut self,
        path: impl Into<String>,
        mode: AfcFopenMode,
    ) -> Result<u64, MobiledeviceError> {
        let path = path.into();
        let mut arguments = (mode as u64).to_le_bytes().to_vec();
        arguments.extend(path.as_bytes());

        let res = self.request(AfcOpcode::FileOpen, arguments, Vec::new()).await?;
        match res.header_payload.get(..8) {
            Some(fd) => Ok(u64::from_le_bytes(fd.try_into().unwrap())),
            None => {
                warn!("FileOpen reply is missing the descriptor");
                Err(MobiledeviceError::UnexpectedResponse)
            }
        }
    }

    /// Applies an advisory lock to an open descriptor
    ///
    /// A contended exclusive lock answers `OpWouldBlock`, which callers are
    /// expected to retry.
    pub async fn lock(&mut self, fd: u64, lock: AfcLockType) -> Result<(), MobiledeviceError> {
        let mut arguments = fd.to_le_bytes().to_vec();
        arguments.extend((lock as u64).to_le_bytes());
        self.request(AfcOpcode::FileLock, arguments, Vec::new())
            .await?;
        Ok(())
    }

    /// Reads the remaining contents of an open descriptor
    pub async fn read_to_end(&mut self, fd: u64) -> Result<Vec<u8>, MobiledeviceError> {
        let mut collected = Vec::new();
        loop {
            let mut arguments = fd.to_le_bytes().to_vec();
            arguments.extend(MAX_TRANSFER.to_le_bytes());
            let res = self.request(AfcOpcode::Read, arguments, Vec::new()).await?;
            if res.payload.is_empty() {
                break;
            }
            collected.extend(res.payload);
        }
        Ok(collected)
    }

    /// Closes an open descriptor
    pub async fn close(&mut self, fd: u64) -> Result<(), MobiledeviceError> {
        self.request(AfcOpcode::FileClose, fd.to_le_bytes().to_vec(), Vec::new())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn status_reply(code: u64) -> Vec<u8> {
        AfcPacket::request(AfcOpcode::Status, 0, code.to_le_bytes().to_vec(), Vec::new())
            .to_bytes()
    }

    #[tokio::test]
    async fn contended_lock_reports_op_would_block() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let mut afc = AfcClient::new(DeviceConnection::new(Box::new(client), "test"));

        server
            .write_all(&status_reply(AfcError::OpWouldBlock as u64))
            .await
            .unwrap();

        match afc.lock(1, AfcLockType::Exclusive).await {
            Err(MobiledeviceError::Afc(AfcError::OpWouldBlock)) => {}
            other => panic!("expected OpWouldBlock, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_returns_descriptor_from_reply() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let mut afc = AfcClient::new(DeviceConnection::new(Box::new(client), "test"));

        let reply = AfcPacket::request(
            AfcOpcode::FileOpenRes,
            0,
            7u64.to_le_bytes().to_vec(),
            Vec::new(),
        );
        server.write_all(&reply.to_bytes()).await.unwrap();

        let fd = afc
            .open("/com.apple.itunes.lock_sync", AfcFopenMode::Rw)
            .await
            .unwrap();
        assert_eq!(fd, 7);
    }

    #[tokio::test]
    async fn read_collects_data_until_an_empty_frame() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let mut afc = AfcClient::new(DeviceConnection::new(Box::new(client), "test"));

        let chunk = AfcPacket::request(AfcOpcode::Data, 0, Vec::new(), b"contents".to_vec());
        server.write_all(&chunk.to_bytes()).await.unwrap();
        let done = AfcPacket::request(AfcOpcode::Data, 1, Vec::new(), Vec::new());
        server.write_all(&done.to_bytes()).await.unwrap();

        let data = afc.read_to_end(4).await.unwrap();
        assert_eq!(data, b"contents");
    }
}
