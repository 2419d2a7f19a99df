pub mod announce;
pub mod backends;
pub mod commands;
pub mod config;
pub mod database;
pub mod error;
pub mod gateway;
pub mod lyrics;
pub mod manager;
pub mod metrics;
pub mod node;
pub mod notify;
pub mod queue;
pub mod search;
pub mod service;
pub mod session;
pub mod settings;
pub mod track;
pub mod voice;
pub mod web;
pub mod webhook;
pub mod ytdlp;

#[cfg(test)]
mod test_support;
