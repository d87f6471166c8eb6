mod transcription;
mod upload;

pub use transcription::TranscriptionHandler;
pub use upload::UploadHandler;
