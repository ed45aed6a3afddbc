pub mod auth;
pub mod controller;
pub mod directory;
pub mod error;
pub mod settings;
pub mod timeline;

pub use auth::{AuthProvider, SessionUser, StaticSession, require_user};
pub use controller::{
    ChatServices, ConnectionState, MessageStreamController, StreamStatus, Update,
};
pub use directory::{
    ConversationDirectory, ConversationSelection, ConversationSummary, sort_by_recent_activity,
};
pub use error::{ChatError, ChatResult};
pub use settings::{ChatSettings, SettingsError, SettingsStore};
pub use timeline::{DeliveryState, EntryKey, MergeOutcome, PendingKey, Timeline, TimelineEntry};
