//! courier: notification dispatch engine.
//!
//! Routes one notification to database, mail and pluggable channels for one
//! or more recipients, immediately or through a job queue, with lifecycle
//! events, locale scoping and a capturing sender for tests.

pub mod channels;
pub mod codec;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod locale;
pub mod logging;
pub mod manager;
pub mod notifiable;
pub mod notification;
pub mod queue;
pub mod registry;
pub mod sender;
pub mod testing;

pub use channels::{Channel, ChannelContext, ChannelKind, ChannelSettings};
pub use codec::NotificationCodec;
pub use config::{ChannelConfig, CourierConfig, WorkerConfig};
pub use error::{Error, Result};
pub use events::{DispatchEvent, DispatchEventKind, EventBus};
pub use manager::{FakeGuard, NotificationManager};
pub use notifiable::{
    AnonymousNotifiable, EntityRecord, Notifiable, NotifiableEntity, NotifiableResolver,
    Recipients,
};
pub use notification::{Envelope, Notification, NotificationId, ShouldQueue};
pub use registry::{ChannelProvider, ChannelRegistry};
pub use sender::{NotificationSender, Sender};
