//! Delivery sinks: where the encoded flyer ends up

use crate::snapshot::EncodedImage;
use crate::{Error, Result};
use log::info;
use std::path::{Path, PathBuf};

/// Turns an encoded image into a user-facing saved file.
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, image: &EncodedImage, filename: &str) -> Result<()>;
}

/// Saves deliveries into a directory.
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Where a delivery with `filename` would be written.
    ///
    /// Only the final path component of `filename` is used so a filename can
    /// never escape the sink directory.
    pub fn target(&self, filename: &str) -> Result<PathBuf> {
        let name = Path::new(filename)
            .file_name()
            .ok_or_else(|| Error::Delivery(format!("Invalid filename: {:?}", filename)))?;
        Ok(self.dir.join(name))
    }
}

impl DeliverySink for FileSink {
    fn deliver(&self, image: &EncodedImage, filename: &str) -> Result<()> {
        let path = self.target(filename)?;
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Delivery(format!("Failed to create {}: {}", self.dir.display(), e)))?;
        std::fs::write(&path, &image.bytes)
            .map_err(|e| Error::Delivery(format!("Failed to write {}: {}", path.display(), e)))?;
        info!("saved {} ({} bytes)", path.display(), image.bytes.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_strips_directories() {
        let sink = FileSink::new("/tmp/out");
        assert_eq!(
            sink.target("../../etc/flyer.png").unwrap(),
            PathBuf::from("/tmp/out/flyer.png")
        );
        assert!(sink.target("..").is_err());
    }

    #[test]
    fn file_sink_writes_bytes() {
        let dir = std::env::temp_dir().join(format!("flyerexport-sink-{}", std::process::id()));
        let sink = FileSink::new(&dir);
        let img = EncodedImage {
            mime: "image/png",
            bytes: vec![1, 2, 3],
        };
        sink.deliver(&img, "movethatcouch-flyer.png").unwrap();
        let written = std::fs::read(dir.join("movethatcouch-flyer.png")).unwrap();
        assert_eq!(written, vec![1, 2, 3]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
