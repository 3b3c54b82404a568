//! Where images come from and how masks go back to disk.

use std::path::{Path, PathBuf};

use image::{GrayImage, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use num_traits::AsPrimitive;
use walkdir::WalkDir;

use crate::config::MaskEncoding;
use crate::errors::{Result, TileSegError};

pub const SUPPORTED_IMAGE_EXTENSIONS: &[&str] =
    &["jpg", "jpeg", "png", "bmp", "tif", "tiff", "webp"];

pub fn is_supported_image_format(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// A single image file or a directory tree of images, yielded one at a time.
#[derive(Debug, Clone)]
pub struct PredictionSource {
    root: PathBuf,
    items: Vec<PathBuf>,
}

impl PredictionSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TileSegError::FileSystem {
                path: path.to_path_buf(),
                operation: "source lookup".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "source path does not exist",
                ),
            });
        }

        if path.is_file() {
            if !is_supported_image_format(path) {
                return Err(TileSegError::ImageProcessing {
                    path: path.display().to_string(),
                    operation: "source type detection".to_string(),
                    source: "unsupported file type".into(),
                });
            }
            let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
            return Ok(Self {
                root,
                items: vec![path.to_path_buf()],
            });
        }

        let items: Vec<_> = WalkDir::new(path)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_supported_image_format(e.path()))
            .map(|e| e.into_path())
            .collect();

        if items.is_empty() {
            return Err(TileSegError::FileSystem {
                path: path.to_path_buf(),
                operation: "source listing".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no images found in folder",
                ),
            });
        }

        tracing::info!(path = %path.display(), items = items.len(), "opened image folder");
        Ok(Self {
            root: path.to_path_buf(),
            items,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Path of `item` relative to the source root.
    pub fn relative_path<'a>(&self, item: &'a Path) -> Result<&'a Path> {
        item.strip_prefix(&self.root)
            .map_err(|_| TileSegError::FileSystem {
                path: item.to_path_buf(),
                operation: "relative path resolution".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "item is outside the source root",
                ),
            })
    }

    /// Decoded images in listing order, each with its file name.
    pub fn iter(&self) -> impl Iterator<Item = Result<(Array3<u8>, String)>> + '_ {
        self.items.iter().map(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            load_image(path).map(|pixels| (pixels, name))
        })
    }
}

/// Decodes an image file into an `(height, width, 3)` RGB array.
pub fn load_image(path: &Path) -> Result<Array3<u8>> {
    let image = image::open(path).map_err(|e| TileSegError::ImageProcessing {
        path: path.display().to_string(),
        operation: "image decoding".to_string(),
        source: Box::new(e),
    })?;
    Ok(image_to_array(&image.into_rgb8()))
}

pub fn image_to_array(image: &RgbImage) -> Array3<u8> {
    // (C, H, W) view -> owned (H, W, C)
    image
        .as_ndarray3()
        .permuted_axes([1, 2, 0])
        .as_standard_layout()
        .into_owned()
}

pub fn array_to_image(pixels: ArrayView3<u8>) -> Result<RgbImage> {
    let (height, width, channels) = pixels.dim();
    if channels != 3 {
        return Err(TileSegError::InvalidImage {
            reason: format!("expected 3 channels, got {channels}"),
            shape: pixels.shape().to_vec(),
        });
    }
    let raw = pixels.as_standard_layout().iter().copied().collect();
    RgbImage::from_raw(width as u32, height as u32, raw).ok_or_else(|| {
        TileSegError::InvalidImage {
            reason: "pixel buffer does not match dimensions".to_string(),
            shape: pixels.shape().to_vec(),
        }
    })
}

/// Renders a class-index mask as an 8-bit grayscale image.
pub fn mask_to_image(
    mask: ArrayView2<usize>,
    num_classes: usize,
    encoding: MaskEncoding,
) -> Result<GrayImage> {
    let (height, width) = mask.dim();
    let raw: Vec<u8> = match encoding {
        MaskEncoding::Index => {
            if num_classes > 256 {
                return Err(TileSegError::invalid_config(
                    "num_classes",
                    num_classes,
                    "index masks hold at most 256 classes in 8 bits",
                ));
            }
            mask.iter().map(|&class| class as u8).collect()
        }
        MaskEncoding::Scaled => {
            let scale = 255.0 / num_classes.max(1) as f32;
            mask.iter()
                .map(|&class| AsPrimitive::<u8>::as_(class as f32 * scale))
                .collect()
        }
    };

    GrayImage::from_raw(width as u32, height as u32, raw).ok_or_else(|| {
        TileSegError::InvalidImage {
            reason: "mask buffer does not match dimensions".to_string(),
            shape: vec![height, width],
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::TempDir;

    #[test]
    fn test_supported_formats() {
        let test_cases = vec![
            ("test.jpg", true),
            ("test.JPEG", true),
            ("test.png", true),
            ("test.tif", true),
            ("test.txt", false),
            ("test", false),
        ];

        for (filename, expected) in test_cases {
            assert_eq!(is_supported_image_format(Path::new(filename)), expected);
        }
    }

    #[test]
    fn test_image_array_round_trip() -> Result<()> {
        let mut image = RgbImage::new(5, 3);
        image.put_pixel(4, 1, Rgb([10, 20, 30]));
        let array = image_to_array(&image);

        assert_eq!(array.dim(), (3, 5, 3));
        assert_eq!(array[[1, 4, 0]], 10);
        assert_eq!(array[[1, 4, 2]], 30);
        assert_eq!(array_to_image(array.view())?, image);
        Ok(())
    }

    #[test]
    fn test_mask_encodings() -> Result<()> {
        let mask = array![[0usize, 1], [2, 3]];
        let index = mask_to_image(mask.view(), 4, MaskEncoding::Index)?;
        assert_eq!(index.get_pixel(1, 1).0, [3]);

        let scaled = mask_to_image(mask.view(), 4, MaskEncoding::Scaled)?;
        assert_eq!(scaled.get_pixel(0, 0).0, [0]);
        assert_eq!(scaled.get_pixel(1, 0).0, [63]);

        assert!(mask_to_image(mask.view(), 300, MaskEncoding::Index).is_err());
        Ok(())
    }

    #[test]
    fn test_open_folder_sorted_and_filtered() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let nested = temp_dir.path().join("nested");
        std::fs::create_dir_all(&nested)?;
        for name in ["b.png", "a.png"] {
            RgbImage::new(4, 4).save(temp_dir.path().join(name))?;
        }
        RgbImage::new(4, 4).save(nested.join("c.png"))?;
        std::fs::write(temp_dir.path().join("notes.txt"), b"ignored")?;

        let source = PredictionSource::open(temp_dir.path())?;
        assert_eq!(source.len(), 3);
        let names: Vec<_> = source
            .paths()
            .iter()
            .map(|p| source.relative_path(p).map(Path::to_path_buf))
            .collect::<Result<_>>()?;
        assert_eq!(
            names,
            vec![
                PathBuf::from("a.png"),
                PathBuf::from("b.png"),
                PathBuf::from("nested/c.png")
            ]
        );

        let decoded: Vec<_> = source.iter().collect::<Result<_>>()?;
        assert_eq!(decoded[0].0.dim(), (4, 4, 3));
        assert_eq!(decoded[0].1, "a.png");
        Ok(())
    }

    #[test]
    fn test_open_rejects_missing_and_empty() -> Result<()> {
        let temp_dir = TempDir::new()?;
        assert!(PredictionSource::open(temp_dir.path().join("missing")).is_err());
        assert!(PredictionSource::open(temp_dir.path()).is_err());

        let text = temp_dir.path().join("file.txt");
        std::fs::write(&text, b"x")?;
        assert!(PredictionSource::open(&text).is_err());
        Ok(())
    }

    #[test]
    fn test_unreadable_image_reports_path() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let broken = temp_dir.path().join("broken.png");
        std::fs::write(&broken, b"not a png")?;

        let source = PredictionSource::open(&broken)?;
        assert_eq!(source.paths().to_vec(), vec![broken.clone()]);
        match source.iter().next() {
            Some(Err(TileSegError::ImageProcessing { path, .. })) => {
                assert!(path.ends_with("broken.png"))
            }
            other => panic!("expected decode error, got {:?}", other.map(|r| r.is_ok())),
        }
        Ok(())
    }
}
