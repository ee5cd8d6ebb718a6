//! Query photo normalisation. Full-resolution uploads exhaust memory in native
//! feature extraction, so every query is scaled until its larger side equals a
//! fixed budget before the engine sees it.

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const STANDARD_BUDGET: u32 = 800;
pub const COMPACT_BUDGET: u32 = 500;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("pixel budget must be positive")]
    ZeroBudget,
    #[error("query image has no pixels")]
    EmptyImage,
    #[error("query image: {0}")]
    Image(#[from] image::ImageError),
    #[error("preprocessing task failed: {0}")]
    Task(String),
}

/// Deployment profile selecting the pixel budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    #[default]
    Standard,
    Compact,
}

impl Profile {
    pub fn budget(self) -> u32 {
        match self {
            Profile::Standard => STANDARD_BUDGET,
            Profile::Compact => COMPACT_BUDGET,
        }
    }
}

impl std::str::FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Profile::Standard),
            "compact" => Ok(Profile::Compact),
            other => Err(format!("unknown profile '{other}', expected standard|compact")),
        }
    }
}

/// Output size with the larger side equal to `budget` and the smaller side scaled
/// proportionally (rounded, never below one pixel).
pub fn bound_dimensions(width: u32, height: u32, budget: u32) -> (u32, u32) {
    let scale = |small: u32, large: u32| -> u32 {
        let (small, large, budget) = (small as u64, large as u64, budget as u64);
        ((small * budget + large / 2) / large).max(1) as u32
    };
    if width >= height {
        (budget, scale(height, width))
    } else {
        (scale(width, height), budget)
    }
}

pub fn resize_to_budget(img: &DynamicImage, budget: u32) -> Result<DynamicImage, PreprocessError> {
    if budget == 0 {
        return Err(PreprocessError::ZeroBudget);
    }
    if img.width() == 0 || img.height() == 0 {
        return Err(PreprocessError::EmptyImage);
    }
    let (w, h) = bound_dimensions(img.width(), img.height(), budget);
    Ok(img.resize_exact(w, h, FilterType::Lanczos3))
}

/// Resizes the image at `path` in place and returns the new dimensions.
/// The output format follows the file extension, falling back to the decoded format.
pub fn preprocess_query(path: &Path, budget: u32) -> Result<(u32, u32), PreprocessError> {
    let reader = image::ImageReader::open(path)
        .map_err(image::ImageError::IoError)?
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?;
    let decoded_format = reader.format();
    let img = reader.decode()?;
    let (from_w, from_h) = (img.width(), img.height());

    let resized = resize_to_budget(&img, budget)?;
    let format = ImageFormat::from_path(path)
        .ok()
        .or(decoded_format)
        .unwrap_or(ImageFormat::Jpeg);
    let resized = match format {
        // JPEG has no alpha channel
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(resized.to_rgb8()),
        _ => resized,
    };
    resized.save_with_format(path, format)?;

    tracing::debug!(
        path = %path.display(),
        from_w,
        from_h,
        to_w = resized.width(),
        to_h = resized.height(),
        "Query image resized"
    );
    Ok((resized.width(), resized.height()))
}

/// [`preprocess_query`] on the blocking pool.
pub async fn preprocess_query_async(path: PathBuf, budget: u32) -> Result<(u32, u32), PreprocessError> {
    tokio::task::spawn_blocking(move || preprocess_query(&path, budget))
        .await
        .map_err(|e| PreprocessError::Task(e.to_string()))?
}
