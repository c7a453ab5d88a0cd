//! The relay core: resolution, duplicate suppression, paced dispatch and
//! the loop that ties them together.

pub mod dispatcher;
pub mod events;
pub mod ledger;
pub mod relay_loop;
pub mod resolver;

pub use dispatcher::{DeliveryOutcome, Dispatcher, FailureReason, RetryPolicy};
pub use events::{EventBus, RelayEvent};
pub use ledger::{DeliveryLedger, prepare_store};
pub use relay_loop::{RelayLoop, RelaySettings, RelayState, RelayStats};
pub use resolver::{ChannelRef, ChannelResolver};
