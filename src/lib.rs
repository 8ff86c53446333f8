//! Storefront chat relay: anonymous widget sessions persisted in Postgres,
//! bridged to a Telegram admin chat with reply correlation back into the
//! originating session.

pub mod app;
pub mod error;
pub mod notify;
pub mod telegram;
pub mod types;
pub mod widget;

pub use app::run;
