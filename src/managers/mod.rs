pub mod model;
pub mod streaming;
pub mod transcription;
