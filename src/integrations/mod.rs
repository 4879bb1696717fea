//! 通道适配器：命令行、HTTP API 与 Telegram

pub mod cli;

#[cfg(feature = "api")]
pub mod api;

#[cfg(feature = "telegram")]
pub mod telegram;
