/// NutriSync - chat synchronization and outbound delivery core
///
/// Keeps a coaching console's conversation view consistent with a push-less
/// relational store: backward cursor pagination, a generation-tagged poll
/// task per open conversation, and an outbound queue writer that records
/// replies for an external dispatcher.

pub mod config;
pub mod error;
pub mod events;
pub mod outbound;
pub mod pager;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod task;
pub mod types;
pub mod view;

pub use config::Config;
pub use error::{Result, SyncError};
pub use session::ChatSession;
