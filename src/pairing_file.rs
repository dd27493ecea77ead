//! Per-host, per-device pairing credentials
//!
//! The muxer is the authoritative store for pair records; this type is the
//! read-through view of one record, with the certificate material parsed
//! into openssl types ready for session upgrades.

use log::warn;
use openssl::{
    pkey::{PKey, Private},
    x509::X509,
};
use plist::Data;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug)]
pub struct PairingFile {
    pub device_certificate: X509,
    pub host_private_key: PKey<Private>,
    pub host_certificate: X509,
    pub root_private_key: PKey<Private>,
    pub root_certificate: X509,
    pub system_buid: String,
    pub host_id: String,
    pub escrow_bag: Option<Vec<u8>>,
    pub wifi_mac_address: Option<String>,
    pub udid: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct RawPairingFile {
    device_certificate: Data,
    host_private_key: Data,
    host_certificate: Data,
    root_private_key: Data,
    root_certificate: Data,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(rename = "HostID")]
    host_id: String,
    escrow_bag: Option<Data>,
    #[serde(rename = "WiFiMACAddress")]
    wifi_mac_address: Option<String>,
    #[serde(rename = "UDID")]
    udid: Option<String>,
}

impl PairingFile {
    pub fn read_from_file(path: impl AsRef<std::path::Path>) -> Result<Self, crate::MobiledeviceError> {
        let f = std::fs::read(path)?;
        Self::from_bytes(&f)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, crate::MobiledeviceError> {
        let r = match plist::from_bytes::<RawPairingFile>(bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("Unable to parse bytes as a raw pairing file: {e:?}");
                return Err(crate::MobiledeviceError::UnexpectedResponse);
            }
        };

        match r.try_into() {
            Ok(r) => Ok(r),
            Err(e) => {
                warn!("Unable to parse certificate material: {e:?}");
                Err(crate::MobiledeviceError::UnexpectedResponse)
            }
        }
    }

    pub fn from_value(v: &plist::Value) -> Result<Self, crate::MobiledeviceError> {
        let raw: RawPairingFile = plist::from_value(v)?;
        let p = raw.try_into()?;
        Ok(p)
    }

    /// Serializes into the XML plist form the muxer stores
    pub fn serialize(&self) -> Result<Vec<u8>, crate::MobiledeviceError> {
        let raw = RawPairingFile::try_from(self)?;

        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &raw)?;
        Ok(buf)
    }

    /// The record's plist form, as sent inside a lockdown `Pair` request
    ///
    /// Private keys never leave the host; the wire record carries only the
    /// public certificate material and identifiers.
    pub fn to_wire_record(&self) -> Result<plist::Dictionary, crate::MobiledeviceError> {
        let mut dict = plist::Dictionary::new();
        dict.insert(
            "DeviceCertificate".into(),
            plist::Value::Data(self.device_certificate.to_pem()?),
        );
        dict.insert(
            "HostCertificate".into(),
            plist::Value::Data(self.host_certificate.to_pem()?),
        );
        dict.insert(
            "RootCertificate".into(),
            plist::Value::Data(self.root_certificate.to_pem()?),
        );
        dict.insert("HostID".into(), self.host_id.clone().into());
        dict.insert("SystemBUID".into(), self.system_buid.clone().into());
        Ok(dict)
    }
}

impl TryFrom<RawPairingFile> for PairingFile {
    type Error = openssl::error::ErrorStack;

    fn try_from(value: RawPairingFile) -> Result<Self, Self::Error> {
        Ok(Self {
            device_certificate: X509::from_pem(&Into::<Vec<u8>>::into(value.device_certificate))?,
            host_private_key: PKey::private_key_from_pem(&Into::<Vec<u8>>::into(
                value.host_private_key,
            ))?,
            host_certificate: X509::from_pem(&Into::<Vec<u8>>::into(value.host_certificate))?,
            root_private_key: PKey::private_key_from_pem(&Into::<Vec<u8>>::into(
                value.root_private_key,
            ))?,
            root_certificate: X509::from_pem(&Into::<Vec<u8>>::into(value.root_certificate))?,
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: value.escrow_bag.map(Into::into),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        })
    }
}

impl TryFrom<&PairingFile> for RawPairingFile {
    type Error = openssl::error::ErrorStack;

    fn try_from(value: &PairingFile) -> Result<Self, Self::Error> {
        Ok(Self {
            device_certificate: Data::new(value.device_certificate.to_pem()?),
            host_private_key: Data::new(value.host_private_key.private_key_to_pem_pkcs8()?),
            host_certificate: Data::new(value.host_certificate.to_pem()?),
            root_private_key: Data::new(value.root_private_key.private_key_to_pem_pkcs8()?),
            root_certificate: Data::new(value.root_certificate.to_pem()?),
            system_buid: value.system_buid.clone(),
            host_id: value.host_id.clone(),
            escrow_bag: value.escrow_bag.clone().map(Data::new),
            wifi_mac_address: value.wifi_mac_address.clone(),
            udid: value.udid.clone(),
        })
    }
}
