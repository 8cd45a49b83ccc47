pub mod errors;
pub mod events;
pub mod id;
pub mod time;

pub use errors::{ConfigError, SyncError, TandemError};
pub use events::EventBus;
pub use id::{new_client_id, new_id, SessionId};
pub use time::now_millis;

pub type Result<T> = std::result::Result<T, TandemError>;
