//! Platform collaborators: the trait the relay talks to and its adapters.

pub mod memory;
pub mod platform;
pub mod telegram;

pub use memory::MemoryPlatform;
pub use platform::*;
pub use telegram::TelegramPlatform;
