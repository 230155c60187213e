pub mod driver;
pub mod lalmax;
pub mod node;
pub mod zlm;

pub use driver::{
    AddStreamProxyRequest, OpenRtpServerRequest, SmsDriver, StreamLiveAddr, PROTOCOL_LALMAX,
    PROTOCOL_ZLM,
};
pub use node::{MediaSettings, NodeManager, DEFAULT_MEDIA_SERVER_ID};
