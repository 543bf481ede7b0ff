pub mod config;
pub mod directory;
pub mod error;
pub mod event_bus;
pub mod types;

pub use config::AppConfig;
pub use directory::{GuestDirectory, InMemoryDirectory};
pub use error::{NotifyError, NotifyResult};
pub use event_bus::EventSink;
