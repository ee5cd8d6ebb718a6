//! "No imagery" detection. The provider answers uncovered locations with a flat
//! grey placeholder, recognisable by its colour at pixel (0,0).

use image::GenericImageView;
use serde::{Deserialize, Serialize};

/// Placeholder grey returned by the imagery provider.
pub const NO_IMAGERY_RGB: [u8; 3] = [228, 227, 223];

/// What a sentinel tile does to the rest of a point's sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentinelPolicy {
    /// Skip every remaining heading/pitch for the point.
    #[default]
    AbortPoint,
    /// Drop only the sentinel tile and keep sweeping.
    SkipTile,
}

impl std::str::FromStr for SentinelPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "abort_point" => Ok(SentinelPolicy::AbortPoint),
            "skip_tile" => Ok(SentinelPolicy::SkipTile),
            other => Err(format!("unknown sentinel policy '{other}', expected abort_point|skip_tile")),
        }
    }
}

/// Decodes `bytes` and compares pixel (0,0) with `sentinel`, allowing each channel
/// to differ by at most `tolerance` (JPEG re-encoding can shift the grey by a step).
pub fn is_no_imagery(bytes: &[u8], sentinel: [u8; 3], tolerance: u8) -> Result<bool, image::ImageError> {
    let img = image::load_from_memory(bytes)?;
    if img.width() == 0 || img.height() == 0 {
        return Ok(false);
    }
    let px = img.get_pixel(0, 0).0;
    Ok(px[..3]
        .iter()
        .zip(sentinel.iter())
        .all(|(&a, &b)| a.abs_diff(b) <= tolerance))
}
