//! # Visual Translator Core
//!
//! Camera text translation pipeline: frames go in, recognized text is
//! language-detected, translated with on-demand models, cached, and
//! published in frame order, with newer frames superseding older work.
//!
//! ## Core:
//! - **frame**: camera frames and their binary envelope
//! - **language**: language tags, pairs and the supported-language catalog
//! - **stages**: recognition, language detection and translation
//! - **models**: model registry and the phrasebook translation models
//! - **cache**: bounded result cache with pinning and snapshots
//! - **pipeline**: admission, supersession, pass execution and delivery
//!
//! ## Service:
//! - **config**, **error**, **state**, **session**, **health**,
//!   **handlers**, **middleware**, **websocket**: the HTTP/WebSocket shell
//!   that hosts pipelines for remote camera clients

pub mod cache;
pub mod config;
pub mod error;
pub mod frame;
pub mod handlers;
pub mod health;
pub mod language;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod session;
pub mod stages;
pub mod state;
pub mod websocket;

#[cfg(test)]
mod testkit;
