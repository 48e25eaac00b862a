//! Presentation helpers: text rendering and console output.

pub mod console;
pub mod render;
