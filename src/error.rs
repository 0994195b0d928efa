//! Error types for flyer export

use thiserror::Error;

/// Result type alias for export operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while exporting a flyer
#[derive(Error, Debug)]
pub enum Error {
    /// The rasterization engine dependency could not be loaded
    #[error("Failed to load dependency {id}: {reason}")]
    DependencyLoad { id: String, reason: String },

    /// The surface did not finish loading within the deadline
    #[error("Flyer render timed out after {0}ms")]
    RenderTimeout(u64),

    /// The surface's content document cannot be reached
    #[error("Unable to access flyer document: {0}")]
    ContentDocumentUnavailable(String),

    /// The designated root element is missing from the loaded content
    #[error("Flyer root #{0} not found")]
    RootElementMissing(String),

    /// Creating or driving the isolated surface failed
    #[error("Surface error: {0}")]
    Surface(String),

    /// Rasterization failed or produced unexpected output
    #[error("Rendering failed: {0}")]
    Render(String),

    /// Encoding the snapshot failed
    #[error("Encoding failed: {0}")]
    Encode(String),

    /// The delivery sink failed to save the image
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// CDP-specific error
    #[cfg(feature = "cdp")]
    #[error("CDP error: {0}")]
    Cdp(String),
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Encode(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::Config(format!("invalid URL: {}", err))
    }
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Cdp(err.to_string())
    }
}
