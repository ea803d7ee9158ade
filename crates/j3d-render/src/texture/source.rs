//! Where texture images come from.

use std::collections::HashMap;
use std::path::PathBuf;

use image::DynamicImage;

use super::TextureError;

/// Resolves texture names to decoded images.
///
/// Called on the texture loader thread.
pub trait ImageSource: Send + Sync {
    fn load_image(&self, name: &str) -> Result<DynamicImage, TextureError>;
}

/// Loads images from files below a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryImageSource {
    root: PathBuf,
}

impl DirectoryImageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ImageSource for DirectoryImageSource {
    fn load_image(&self, name: &str) -> Result<DynamicImage, TextureError> {
        let path = self.root.join(name);
        if !path.is_file() {
            return Err(TextureError::NotFound(name.to_string()));
        }
        image::open(&path).map_err(|e| TextureError::Decode {
            name: name.to_string(),
            message: e.to_string(),
        })
    }
}

/// Images registered up front, for embedded assets.
#[derive(Debug, Clone, Default)]
pub struct MemoryImageSource {
    images: HashMap<String, DynamicImage>,
}

impl MemoryImageSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, image: DynamicImage) {
        self.images.insert(name.into(), image);
    }

    #[must_use]
    pub fn with_image(mut self, name: impl Into<String>, image: DynamicImage) -> Self {
        self.insert(name, image);
        self
    }
}

impl ImageSource for MemoryImageSource {
    fn load_image(&self, name: &str) -> Result<DynamicImage, TextureError> {
        self.images
            .get(name)
            .cloned()
            .ok_or_else(|| TextureError::NotFound(name.to_string()))
    }
}
