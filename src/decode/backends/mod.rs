pub mod synthetic;

#[cfg(feature = "decode-ffmpeg")]
pub mod ffmpeg;

pub use synthetic::SyntheticBackend;

#[cfg(feature = "decode-ffmpeg")]
pub use self::ffmpeg::FfmpegBackend;
