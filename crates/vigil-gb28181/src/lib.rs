pub mod collector;
pub mod device;
pub mod manscdp;
pub mod play;
pub mod ptz;
pub mod server;

pub use collector::CatalogCollector;
pub use device::{DeviceSession, SessionStore};
pub use manscdp::{CatalogItem, DeviceInfo};
pub use play::{PlaySession, SsrcAllocator};
pub use server::{GbConfig, GbHandler, GbServer, RegisterContext};
