use std::error::Error as StdError;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// Invalid or unsupported configuration (codec, sample rate, resolution)
    Config(String),
    /// File, socket and signal plumbing failures
    Io(io::Error),
    /// An upstream capture API returned failure (NvFBC, PipeWire, DRM helper)
    Capture(String),
    /// A CUDA, EGL or GL operation failed
    Gpu(String),
    /// Codec open/send/receive/parameter failures
    Encoder(String),
    /// Container header/frame/trailer failures
    Muxer(String),
    /// User- or peer-initiated cancellation
    Cancelled,
    /// Waited longer than the fixed budget on the DRM helper
    Timeout(String),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn encoder(err: ffmpeg_next::Error) -> Self {
        Error::Encoder(err.to_string())
    }

    pub fn muxer(err: ffmpeg_next::Error) -> Self {
        Error::Muxer(err.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {msg}"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::Capture(msg) => write!(f, "Capture error: {msg}"),
            Error::Gpu(msg) => write!(f, "GPU error: {msg}"),
            Error::Encoder(msg) => write!(f, "Encoder error: {msg}"),
            Error::Muxer(msg) => write!(f, "Muxer error: {msg}"),
            Error::Cancelled => write!(f, "Cancelled"),
            Error::Timeout(msg) => write!(f, "Timed out: {msg}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Error::Io(io::Error::from_raw_os_error(err as i32))
    }
}

impl From<pipewire::Error> for Error {
    fn from(err: pipewire::Error) -> Self {
        Error::Capture(err.to_string())
    }
}

impl From<khronos_egl::Error> for Error {
    fn from(err: khronos_egl::Error) -> Self {
        Error::Gpu(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
