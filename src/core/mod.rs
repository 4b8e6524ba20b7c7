pub mod config;
pub mod frame;
pub mod health;
pub mod heartbeat;
pub mod protocol;
pub mod reconnect;
pub mod types;

pub use config::*;
pub use frame::*;
pub use health::*;
pub use heartbeat::*;
pub use protocol::*;
pub use reconnect::*;
pub use types::*;
