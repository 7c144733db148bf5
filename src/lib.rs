pub mod error;
pub mod k8s;

pub use error::{Error, Result};
pub use k8s::client::ApiClient;
pub use k8s::config::{ConnectionConfig, ConnectionOptions};
pub use k8s::resource::{ResourceClient, ResourcePath};
pub use k8s::watch::{EventSource, Notice, ResyncConfig, ResyncStream};
