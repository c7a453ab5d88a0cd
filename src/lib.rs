//! Channel relay: mirror one channel into another, filtered and paced.

pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod relay;
pub mod store;
