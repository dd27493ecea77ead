//! SpringBoard services client
//!
//! Fetches app icon PNGs, recorded as placeholder icons in a backup's
//! Info.plist.

use crate::{DeviceConnection, DeviceService, MobiledeviceError};

#[derive(Debug)]
pub struct SpringBoardServicesClient {
    pub connection: DeviceConnection,
}

impl DeviceService for SpringBoardServicesClient {
    fn service_name() -> std::borrow::Cow<'static, str> {
        std::borrow::Cow::Borrowed("com.apple.springboardservices")
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, MobiledeviceError> {
        Ok(Self::new(connection))
    }
}

impl SpringBoardServicesClient {
    pub fn new(connection: DeviceConnection) -> Self {
        Self { connection }
    }

    /// Retrieves the PNG icon data for an app
    pub async fn get_icon_pngdata(
        &mut self,
        bundle_identifier: impl Into<String>,
    ) -> Result<Vec<u8>, MobiledeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("command".into(), "getIconPNGData".into());
        req.insert("bundleId".into(), bundle_identifier.into().into());
        self.connection.send_plist(plist::Value::Dictionary(req)).await?;

        let mut res = self.connection.read_plist().await?;
        match res.remove("pngData") {
            Some(plist::Value::Data(res)) => Ok(res),
            _ => Err(MobiledeviceError::UnexpectedResponse),
        }
    }
}
