//! Script discovery
//!
//! Scripts are plain files in one directory, launched through a configured
//! interpreter. See [`ScriptResolver`] for the naming rules.

pub mod resolver;

pub use resolver::{Script, ScriptResolver};
