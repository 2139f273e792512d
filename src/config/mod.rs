// src/config/mod.rs
pub mod chime;

pub use chime::ChimeConfig;
