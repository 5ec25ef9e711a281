//! Configuration schema and persistent store

pub mod schema;
pub mod store;

pub use schema::{AppConfig, AudioSettings, DecoderSettings, EncoderSettings, RecorderSettings};
pub use store::{ConfigChange, ConfigStore};
