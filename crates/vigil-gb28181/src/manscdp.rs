// GB/T 28181-2022 MANSCDP XML 词汇表
// 入站消息体的解析与出站查询/控制报文的构造

use quick_xml::de::from_str;
use serde::Deserialize;
use vigil_core::{Result, VigilError};

pub const CONTENT_TYPE_XML: &str = "Application/MANSCDP+xml";

/// 入站 MESSAGE 消息体的命令类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdType {
    Keepalive,
    Catalog,
    DeviceInfo,
    DeviceStatus,
    ConfigDownload,
    Unknown,
}

/// 粗分类（完整解析前先看 CmdType，避免为心跳做整棵树反序列化）
pub fn classify(body: &str) -> CmdType {
    if body.contains("<CmdType>Keepalive</CmdType>") {
        CmdType::Keepalive
    } else if body.contains("<CmdType>Catalog</CmdType>") {
        CmdType::Catalog
    } else if body.contains("<CmdType>DeviceInfo</CmdType>") {
        CmdType::DeviceInfo
    } else if body.contains("<CmdType>DeviceStatus</CmdType>") {
        CmdType::DeviceStatus
    } else if body.contains("<CmdType>ConfigDownload</CmdType>") {
        CmdType::ConfigDownload
    } else {
        CmdType::Unknown
    }
}

/// 目录响应（可能分多条 MESSAGE 到达）
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogResponse {
    pub cmd_type: String,
    #[serde(rename = "SN", default)]
    pub sn: Option<u32>,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    #[serde(default)]
    pub sum_num: Option<u32>,
    #[serde(default)]
    pub device_list: Option<DeviceList>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceList {
    #[serde(rename = "@Num", default)]
    pub num: Option<u32>,
    #[serde(rename = "Item", default)]
    pub items: Vec<CatalogItem>,
}

/// 目录项（通道信息）
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct CatalogItem {
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub owner: String,
    pub civil_code: String,
    pub address: String,
    pub parental: u8,
    #[serde(rename = "ParentID")]
    pub parent_id: String,
    /// ON / OFF / OK，部分厂商混用
    pub status: String,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
}

impl CatalogItem {
    pub fn is_online(&self) -> bool {
        self.status == "ON" || self.status == "OK"
    }
}

/// 设备信息响应
#[derive(Debug, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeviceInfo {
    pub cmd_type: String,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub device_name: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,
    pub result: String,
}

/// 设备状态响应，Online/Status 两种厂商写法都兼容
#[derive(Debug, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeviceStatus {
    pub cmd_type: String,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub online: String,
    pub status: String,
    pub result: String,
}

impl DeviceStatus {
    pub fn is_online(&self) -> bool {
        self.online.eq_ignore_ascii_case("ONLINE")
            || self.status.eq_ignore_ascii_case("ONLINE")
            || self.status.eq_ignore_ascii_case("OK")
    }
}

/// 心跳通知
#[derive(Debug, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct KeepaliveNotify {
    pub cmd_type: String,
    #[serde(rename = "SN", default)]
    pub sn: Option<u32>,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub status: String,
}

fn parse<T: serde::de::DeserializeOwned>(xml: &str) -> Result<T> {
    from_str(xml.trim()).map_err(|e| VigilError::InvalidInput(format!("MANSCDP parse: {e}")))
}

pub fn parse_catalog(xml: &str) -> Result<CatalogResponse> {
    parse(xml)
}

pub fn parse_device_info(xml: &str) -> Result<DeviceInfo> {
    parse(xml)
}

pub fn parse_device_status(xml: &str) -> Result<DeviceStatus> {
    parse(xml)
}

pub fn parse_keepalive(xml: &str) -> Result<KeepaliveNotify> {
    parse(xml)
}

/// 目录查询报文
pub fn catalog_query_xml(sn: u32, device_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n\
         <Query>\r\n\
         <CmdType>Catalog</CmdType>\r\n\
         <SN>{sn}</SN>\r\n\
         <DeviceID>{device_id}</DeviceID>\r\n\
         </Query>\r\n"
    )
}

/// 设备信息查询报文
pub fn device_info_query_xml(sn: u32, device_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n\
         <Query>\r\n\
         <CmdType>DeviceInfo</CmdType>\r\n\
         <SN>{sn}</SN>\r\n\
         <DeviceID>{device_id}</DeviceID>\r\n\
         </Query>\r\n"
    )
}

/// 基础配置下载查询报文
pub fn config_download_query_xml(sn: u32, device_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n\
         <Query>\r\n\
         <CmdType>ConfigDownload</CmdType>\r\n\
         <SN>{sn}</SN>\r\n\
         <DeviceID>{device_id}</DeviceID>\r\n\
         <ConfigType>BasicParam</ConfigType>\r\n\
         </Query>\r\n"
    )
}

/// 云台控制报文，ptz_cmd 为 8 字节控制字的大写十六进制
pub fn device_control_xml(sn: u32, channel_id: &str, ptz_cmd: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n\
         <Control>\r\n\
         <CmdType>DeviceControl</CmdType>\r\n\
         <SN>{sn}</SN>\r\n\
         <DeviceID>{channel_id}</DeviceID>\r\n\
         <PTZCmd>{ptz_cmd}</PTZCmd>\r\n\
         </Control>\r\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify("<Notify><CmdType>Keepalive</CmdType></Notify>"),
            CmdType::Keepalive
        );
        assert_eq!(
            classify("<Response><CmdType>Catalog</CmdType></Response>"),
            CmdType::Catalog
        );
        assert_eq!(classify("<Response><CmdType>Alarm</CmdType></Response>"), CmdType::Unknown);
    }

    #[test]
    fn test_parse_catalog_chunk() {
        let xml = r#"<?xml version="1.0" encoding="GB2312"?>
<Response>
<CmdType>Catalog</CmdType>
<SN>17430</SN>
<DeviceID>34020000001320000001</DeviceID>
<SumNum>3</SumNum>
<DeviceList Num="2">
<Item>
<DeviceID>34020000001310000001</DeviceID>
<Name>Camera 01</Name>
<Manufacturer>Hikvision</Manufacturer>
<Model>DS-2CD3T46WD</Model>
<ParentID>34020000001320000001</ParentID>
<Status>ON</Status>
</Item>
<Item>
<DeviceID>34020000001310000002</DeviceID>
<Name>Camera 02</Name>
<Status>OFF</Status>
</Item>
</DeviceList>
</Response>"#;

        let msg = parse_catalog(xml).unwrap();
        assert_eq!(msg.sum_num, Some(3));
        let list = msg.device_list.unwrap();
        assert_eq!(list.num, Some(2));
        assert_eq!(list.items.len(), 2);
        assert!(list.items[0].is_online());
        assert!(!list.items[1].is_online());
        assert_eq!(list.items[0].manufacturer, "Hikvision");
    }

    #[test]
    fn test_parse_keepalive() {
        let xml = r#"<?xml version="1.0"?>
<Notify>
<CmdType>Keepalive</CmdType>
<SN>255</SN>
<DeviceID>34020000001320000001</DeviceID>
<Status>OK</Status>
</Notify>"#;
        let msg = parse_keepalive(xml).unwrap();
        assert_eq!(msg.device_id, "34020000001320000001");
        assert_eq!(msg.status, "OK");
    }

    #[test]
    fn test_parse_device_info() {
        let xml = r#"<Response>
<CmdType>DeviceInfo</CmdType>
<SN>2</SN>
<DeviceID>34020000001320000001</DeviceID>
<DeviceName>IPC</DeviceName>
<Manufacturer>Dahua</Manufacturer>
<Model>DH-IPC-HFW</Model>
<Firmware>V2.800</Firmware>
<Result>OK</Result>
</Response>"#;
        let info = parse_device_info(xml).unwrap();
        assert_eq!(info.manufacturer, "Dahua");
        assert_eq!(info.firmware, "V2.800");
    }

    #[test]
    fn test_device_status_vendor_spellings() {
        let a = parse_device_status("<Response><CmdType>DeviceStatus</CmdType><DeviceID>1</DeviceID><Online>ONLINE</Online></Response>").unwrap();
        assert!(a.is_online());
        let b = parse_device_status("<Response><CmdType>DeviceStatus</CmdType><DeviceID>1</DeviceID><Status>OFFLINE</Status></Response>").unwrap();
        assert!(!b.is_online());
    }

    #[test]
    fn test_query_builders() {
        let xml = catalog_query_xml(456, "34020000001320000001");
        assert!(xml.contains("<CmdType>Catalog</CmdType>"));
        assert!(xml.contains("<SN>456</SN>"));
        assert!(xml.contains("<DeviceID>34020000001320000001</DeviceID>"));

        let xml = config_download_query_xml(1, "34020000001320000001");
        assert!(xml.contains("<ConfigType>BasicParam</ConfigType>"));

        let xml = device_control_xml(7, "34020000001310000001", "A50F0100080F0F00");
        assert!(xml.contains("<PTZCmd>A50F0100080F0F00</PTZCmd>"));
    }
}
