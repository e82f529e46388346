pub mod config;
pub mod error;
pub mod event;
pub mod fleet;
pub mod show;

pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use error::Error;
pub use error::Result;
pub use event::Event;
pub use event::EventBus;
pub use fleet::client::DeviceClient;
pub use fleet::client::HttpDeviceClient;
pub use fleet::discovery::Discovery;
pub use fleet::dispatcher::Dispatcher;
pub use fleet::health::HealthMonitor;
pub use fleet::registry::Registry;
pub use show::controller::CommandSink;
pub use show::controller::PhaseController;
