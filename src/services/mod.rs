pub mod archive;
pub mod auth;
pub mod converter;
pub mod exporter;
pub mod importer;
pub mod listen_store;

pub use auth::AuthService;
pub use exporter::ListenExporter;
pub use importer::ImportService;
pub use listen_store::{ListenCountCache, ListenStore, PgListenStore, RedisListenCount};
