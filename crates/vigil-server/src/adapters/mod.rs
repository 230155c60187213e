pub mod gb;
pub mod onvif;
pub mod rtmp;
pub mod rtsp;

pub use gb::{GbAdapter, GbBridge};
pub use onvif::OnvifAdapter;
pub use rtmp::RtmpAdapter;
pub use rtsp::RtspAdapter;
