#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod api;
pub mod auth;
pub mod cache;
pub mod circuit_breaker;
pub mod client;
pub mod error;
pub mod event;
pub mod quality;
pub mod recovery;
pub(crate) mod serde_helpers;
pub mod session;
pub mod state;
pub mod types;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use client::{Client, Config};
pub use event::Event;
