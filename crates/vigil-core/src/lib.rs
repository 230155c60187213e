pub mod entity;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{Result, VigilError};
pub use protocol::{PlayDescriptor, PresetCommand, Protocol, Publisher, PtzControl, PtzDirection};
pub use types::{
    channel_type_of_stream, mint_id, ChannelExt, ChannelType, DeviceExt, ServerPorts, StreamConfig,
    StreamMode, Zone, IGNORE_PASSWORD,
};
