#![warn(clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::future_not_send,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::option_if_let_else,
    clippy::single_call_fn
)]

pub mod caldav;
pub mod config;
pub mod mail;
pub mod navigate;
pub mod portal;
pub mod retry;
pub mod schedule;
pub mod week;
