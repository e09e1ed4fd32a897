//! lazycomm: serve scripts over HTTP
//!
//! Each request launches one script process, hands it the request over
//! stdin and relays the framed response it prints on stdout.

pub mod bridge;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod script;
pub mod state;
pub mod web;
