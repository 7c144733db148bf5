pub mod client;
pub mod config;
pub mod decoder;
pub mod resource;
pub mod transport;
pub mod utils;
pub mod watch;

/// Default user agent for `kubestream` - automatically uses the package version
///
/// Sent on every request made through `client::new(Some(USER_AGENT))`, which
/// is what `ApiClient::try_from_config` uses.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
