#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod app;
pub mod config;
pub mod data;
pub mod feed;
pub mod session;
pub mod trigger;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
pub use feed::{FeedController, FeedEvent, FeedOptions};
