//! Core crate for puppeteer: checkpoint caching, frame normalization, video
//! framing, the inference boundary and the web server.

pub mod checkpoint;
pub mod config;
pub mod inference;
pub mod logging;
pub mod media;
pub mod normalize;
pub mod pipeline;
pub mod runtime;
pub mod server;
pub mod types;
