pub mod config;
pub mod door;
pub mod mqtt;
pub mod routes;
pub mod store;
pub mod types;

pub use config::{ConfigDocument, ConfigError, DeviceConfig};
pub use door::{Delegate, DoorController};
pub use mqtt::{BrokerAddress, BrokerSettings, Credentials};
pub use routes::{Asset, LastModified, NotFoundReport, Route, MANIFEST_JSON, ROUTES};
pub use store::{FileStore, StoreError};
pub use types::{ActionKind, DoorState};
