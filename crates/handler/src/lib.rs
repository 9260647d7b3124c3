pub mod directory;
pub mod error;
pub mod handler;
pub mod notifier;
pub mod notify_handler;
pub mod outcome;
pub mod registry;
pub mod testing;

pub use directory::{ActorDirectory, StaticActorDirectory};
pub use error::{HandlerError, NotifyError};
pub use handler::{ActionHandler, DynHandler};
pub use notifier::{LogNotifier, Notifier, notify_all};
pub use notify_handler::{NotifyHandler, USER_ENTITY};
pub use outcome::{HandlerOutcome, HandlerResult};
pub use registry::HandlerRegistry;
