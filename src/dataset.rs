//! Labelled validation crops cut with the same planner used for inference.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{prelude::*, AxisDescription, Slice};
use num_traits::Zero;
use parking_lot::Mutex;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::errors::{Result, TileSegError};
use crate::source::load_image;
use crate::tiling::{TileInterval, TilePlanner};

/// Ordered label colours; the k-th colour is class k.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassEncoding {
    colors: Vec<[u8; 3]>,
}

impl ClassEncoding {
    pub fn new(colors: Vec<[u8; 3]>) -> Result<Self> {
        if colors.is_empty() || colors.len() > 256 {
            return Err(TileSegError::invalid_config(
                "class_encoding",
                colors.len(),
                "between 1 and 256 colours are required",
            ));
        }
        Ok(Self { colors })
    }

    pub fn num_classes(&self) -> usize {
        self.colors.len()
    }

    pub fn colors(&self) -> &[[u8; 3]] {
        &self.colors
    }

    /// Maps an RGB label image to class indices. Unknown colours become class 0;
    /// if a colour is listed twice the later class wins.
    pub fn encode(&self, label: ArrayView3<u8>) -> Result<Array2<u8>> {
        let (height, width, channels) = label.dim();
        if channels != 3 {
            return Err(TileSegError::InvalidImage {
                reason: format!("label images must be RGB, got {channels} channels"),
                shape: label.shape().to_vec(),
            });
        }

        Ok(Array2::from_shape_fn((height, width), |(y, x)| {
            let pixel = [label[[y, x, 0]], label[[y, x, 1]], label[[y, x, 2]]];
            self.colors
                .iter()
                .rposition(|color| *color == pixel)
                .map_or(0, |class| class as u8)
        }))
    }
}

/// Unbounded memo of decoded files, keyed by path. Entries live until `clear`.
#[derive(Debug)]
pub struct ImageCache<V> {
    entries: Mutex<HashMap<PathBuf, Arc<V>>>,
}

impl<V> Default for ImageCache<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> ImageCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value for `path`, running `load` on a miss.
    ///
    /// The lock is not held while loading, so two threads missing on the same
    /// path may both load it; the first insert wins.
    pub fn get_or_load<F>(&self, path: &Path, load: F) -> Result<Arc<V>>
    where
        F: FnOnce(&Path) -> Result<V>,
    {
        if let Some(value) = self.entries.lock().get(path) {
            return Ok(Arc::clone(value));
        }

        let value = Arc::new(load(path)?);
        let mut entries = self.entries.lock();
        Ok(Arc::clone(
            entries.entry(path.to_path_buf()).or_insert(value),
        ))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// An RGB image `(H, W, 3)` with its class-index label `(H, W)`.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledImage {
    pub image: Array3<u8>,
    pub label: Array2<u8>,
}

/// One dataset entry: a file pair and, when slicing, the crop to cut from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CropSample {
    pub image_path: PathBuf,
    pub label_path: PathBuf,
    pub interval: Option<TileInterval>,
}

/// Image/label pairs laid out as `<split>/**/Images/*.png` with the label of
/// each image at the same name under a sibling `Labels/` directory.
pub struct CropDataset {
    samples: Vec<CropSample>,
    encoding: ClassEncoding,
    cache: ImageCache<LabeledImage>,
}

impl CropDataset {
    /// Discovers samples under `root`. With `slice_size`, every image is cut
    /// into non-overlapping `slice_size` crops, zero-padded at the edges.
    pub fn scan(
        root: impl AsRef<Path>,
        encoding: ClassEncoding,
        slice_size: Option<usize>,
    ) -> Result<Self> {
        let root = root.as_ref();
        let planner = slice_size.map(TilePlanner::non_overlapping).transpose()?;

        let image_paths: Vec<PathBuf> = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_split_image(e.path()))
            .map(|e| e.into_path())
            .collect();

        let mut samples = Vec::new();
        for image_path in image_paths {
            let label_path = label_path_for(&image_path)?;
            if !label_path.is_file() {
                return Err(TileSegError::Dataset {
                    reason: format!(
                        "missing label {} for image {}",
                        label_path.display(),
                        image_path.display()
                    ),
                });
            }

            match &planner {
                Some(planner) => {
                    let (width, height) = image::image_dimensions(&image_path).map_err(|e| {
                        TileSegError::ImageProcessing {
                            path: image_path.display().to_string(),
                            operation: "header read".to_string(),
                            source: Box::new(e),
                        }
                    })?;
                    let plan = planner.plan(height as usize, width as usize);
                    debug!(path = %image_path.display(), crops = plan.len(), "sliced sample");
                    samples.extend(plan.iter().map(|interval| CropSample {
                        image_path: image_path.clone(),
                        label_path: label_path.clone(),
                        interval: Some(interval.clone()),
                    }));
                }
                None => samples.push(CropSample {
                    image_path,
                    label_path,
                    interval: None,
                }),
            }
        }

        if samples.is_empty() {
            return Err(TileSegError::Dataset {
                reason: format!("no Images/*.png found under {}", root.display()),
            });
        }

        info!(root = %root.display(), samples = samples.len(), "scanned dataset");
        Ok(Self {
            samples,
            encoding,
            cache: ImageCache::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[CropSample] {
        &self.samples
    }

    pub const fn encoding(&self) -> &ClassEncoding {
        &self.encoding
    }

    pub const fn cache(&self) -> &ImageCache<LabeledImage> {
        &self.cache
    }

    pub fn get(&self, index: usize) -> Result<LabeledImage> {
        let sample = self.samples.get(index).ok_or_else(|| TileSegError::Dataset {
            reason: format!("index {index} out of range for {} samples", self.samples.len()),
        })?;

        let full = self.cache.get_or_load(&sample.image_path, |image_path| {
            self.load_pair(image_path, &sample.label_path)
        })?;

        Ok(match &sample.interval {
            Some(interval) => LabeledImage {
                image: crop_padded(full.image.view(), interval),
                label: crop_padded(full.label.view(), interval),
            },
            None => (*full).clone(),
        })
    }

    fn load_pair(&self, image_path: &Path, label_path: &Path) -> Result<LabeledImage> {
        let image = load_image(image_path)?;
        let label = self.encoding.encode(load_image(label_path)?.view())?;

        if label.dim() != (image.dim().0, image.dim().1) {
            return Err(TileSegError::Dataset {
                reason: format!(
                    "label {} is {:?}, image is {:?}",
                    label_path.display(),
                    label.dim(),
                    image.dim()
                ),
            });
        }
        Ok(LabeledImage { image, label })
    }
}

fn is_split_image(path: &Path) -> bool {
    let is_png = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
    let in_images_dir = path
        .parent()
        .and_then(Path::file_name)
        .is_some_and(|dir| dir == "Images");
    is_png && in_images_dir
}

fn label_path_for(image_path: &Path) -> Result<PathBuf> {
    let split_dir = image_path.parent().and_then(Path::parent);
    match (split_dir, image_path.file_name()) {
        (Some(dir), Some(name)) => Ok(dir.join("Labels").join(name)),
        _ => Err(TileSegError::Dataset {
            reason: format!("cannot derive label path for {}", image_path.display()),
        }),
    }
}

/// Cuts `interval` out of the first two axes of `source`; rows and columns
/// beyond the source are left as zero.
fn crop_padded<A, D>(source: ArrayView<A, D>, interval: &TileInterval) -> Array<A, D>
where
    A: Clone + Zero,
    D: Dimension,
{
    let height = interval.valid_height(source.shape()[0]);
    let width = interval.valid_width(source.shape()[1]);

    let mut shape = source.raw_dim();
    shape[0] = interval.rows.len();
    shape[1] = interval.cols.len();
    let mut crop = Array::zeros(shape);

    let window = source.slice_each_axis(|axis: AxisDescription| match axis.axis.index() {
        0 => Slice::from(interval.rows.start..interval.rows.start + height),
        1 => Slice::from(interval.cols.start..interval.cols.start + width),
        _ => Slice::from(..),
    });
    crop.slice_each_axis_mut(|axis: AxisDescription| match axis.axis.index() {
        0 => Slice::from(..height),
        1 => Slice::from(..width),
        _ => Slice::from(..),
    })
    .assign(&window);

    crop
}
