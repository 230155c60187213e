pub mod channels;
pub mod devices;
pub mod events;
pub mod media_servers;
pub mod recordings;
pub mod schema_versions;

pub mod prelude {
    pub use super::channels::Entity as Channels;
    pub use super::devices::Entity as Devices;
    pub use super::events::Entity as Events;
    pub use super::media_servers::Entity as MediaServers;
    pub use super::recordings::Entity as Recordings;
    pub use super::schema_versions::Entity as SchemaVersions;
}
