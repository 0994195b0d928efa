//! Snapshot, encoding and the rasterizer seam

use crate::dependency::DependencySource;
use crate::host::ElementHandle;
use crate::{Dimensions, Error, Result};
use base64::Engine as Base64Engine;
use futures::future::BoxFuture;
use image::{ImageFormat, Rgba, RgbaImage};
use serde::Serialize;
use std::io::Cursor;

/// Opaque white, the only background flyers are captured with.
pub const BACKGROUND: &str = "#ffffff";

/// Options bag handed to the rasterization engine.
///
/// Serializes to the camelCase shape html2canvas expects.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RasterOptions {
    pub background_color: String,
    /// Always 1: the surface is already sized to the target resolution.
    pub scale: f64,
    pub width: u32,
    pub height: u32,
    /// Cross-origin images are allowed (and may taint the canvas). Flyers
    /// embed externally hosted images and fonts; without this the capture
    /// comes back blank for them.
    #[serde(rename = "useCORS")]
    pub use_cors: bool,
    pub allow_taint: bool,
    pub logging: bool,
}

impl RasterOptions {
    pub fn for_dimensions(dims: Dimensions) -> Self {
        Self {
            background_color: BACKGROUND.to_string(),
            scale: 1.0,
            width: dims.width,
            height: dims.height,
            use_cors: true,
            allow_taint: true,
            logging: false,
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }
}

/// Rasterization engine that captures an element of a loaded surface.
pub trait Rasterizer: Send + Sync {
    /// Dependency that must be present in the host document before use.
    fn dependency(&self) -> Option<DependencySource> {
        None
    }

    fn rasterize<'a>(
        &'a self,
        root: &'a ElementHandle,
        options: &'a RasterOptions,
    ) -> BoxFuture<'a, Result<Snapshot>>;
}

/// In-memory raster of the flyer root.
#[derive(Debug, Clone)]
pub struct Snapshot {
    image: RgbaImage,
}

impl Snapshot {
    pub fn new(image: RgbaImage) -> Self {
        Self { image }
    }

    /// A snapshot filled with a single colour.
    pub fn filled(dims: Dimensions, rgba: [u8; 4]) -> Self {
        Self::new(RgbaImage::from_pixel(dims.width, dims.height, Rgba(rgba)))
    }

    /// Decode PNG bytes returned by a backend.
    pub fn from_png(bytes: &[u8]) -> Result<Self> {
        let img = image::load_from_memory_with_format(bytes, ImageFormat::Png)
            .map_err(|e| Error::Render(format!("Snapshot is not a valid PNG: {}", e)))?;
        Ok(Self::new(img.to_rgba8()))
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.image.width(), self.image.height())
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        self.image.get_pixel(x, y).0
    }

    pub fn encode_png(&self) -> Result<EncodedImage> {
        let mut bytes = Vec::new();
        self.image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(EncodedImage {
            mime: "image/png",
            bytes,
        })
    }
}

/// Portable encoding of a snapshot, handed to the sink once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

impl EncodedImage {
    /// Self-contained `data:` URI for the payload.
    pub fn data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }

    /// Parse a `data:image/png;base64,...` URI.
    pub fn from_data_uri(uri: &str) -> Result<Self> {
        let payload = uri
            .strip_prefix("data:image/png;base64,")
            .ok_or_else(|| Error::Render("Expected a PNG data URI".into()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| Error::Render(format!("Bad base64 in data URI: {}", e)))?;
        Ok(Self {
            mime: "image/png",
            bytes,
        })
    }
}
