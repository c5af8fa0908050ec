pub mod import;
pub mod listen;
pub mod user;

pub use import::{ImportResponse, ImportResult, ImportStats};
pub use listen::{Listen, PortableListen};
pub use user::{ImportOptions, ProfileInfo, ResetLatestImportRequest, User};
