use serde::Deserialize;

#[derive(Deserialize)]
pub struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<DeviceListEntry>,
}

#[derive(Deserialize)]
pub struct DeviceListEntry {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DeviceProperties,
}

#[derive(Deserialize)]
pub struct DeviceProperties {
    #[serde(rename = "ConnectionType")]
    pub connection_type: String,
    #[serde(rename = "NetworkAddress")]
    pub network_address: Option<plist::Data>,
    #[serde(rename = "InterfaceIndex")]
    pub interface_index: Option<u32>,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
}

/// One message received in listen mode
#[derive(Deserialize)]
pub struct ListenEvent {
    #[serde(rename = "MessageType")]
    pub message_type: String,
    #[serde(rename = "DeviceID")]
    pub device_id: Option<u32>,
    #[serde(rename = "Properties")]
    pub properties: Option<DeviceProperties>,
}
