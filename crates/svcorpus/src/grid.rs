//! Sample point generation: a linear mesh over a bounding box, or an explicit
//! colon-delimited `lat,lng` list.

use crate::geo::{BoundingBox, SamplePoint};
use std::collections::HashSet;
use thiserror::Error;

/// Upper bound on the sample points of one run, from either source.
pub const MAX_SAMPLE_POINTS: usize = 100_000;

#[derive(Debug, Error, PartialEq)]
pub enum GridError {
    #[error("density must be at least 1")]
    ZeroDensity,
    #[error("bounding box has non-finite coordinates")]
    NonFinite,
    #[error("malformed point '{0}', expected 'lat,lng'")]
    BadPoint(String),
    #[error("point list is empty")]
    Empty,
    #[error("{requested} sample points requested, at most {limit} allowed")]
    TooManyPoints { requested: u64, limit: usize },
}

/// Where a capture run takes its sample points from.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleSource {
    Mesh { bbox: BoundingBox, density: u32 },
    List(Vec<SamplePoint>),
}

impl SampleSource {
    pub fn points(&self) -> Result<Vec<SamplePoint>, GridError> {
        match self {
            SampleSource::Mesh { bbox, density } => mesh(bbox, *density),
            SampleSource::List(points) if points.is_empty() => Err(GridError::Empty),
            SampleSource::List(points) if points.len() > MAX_SAMPLE_POINTS => Err(GridError::TooManyPoints {
                requested: points.len() as u64,
                limit: MAX_SAMPLE_POINTS,
            }),
            SampleSource::List(points) => Ok(points.clone()),
        }
    }
}

/// Builds the `(density+1)²` mesh, outer loop over longitude, inner over latitude,
/// starting at `(lat2, lng2)`. Both corners are hit exactly. Meshes larger than
/// [`MAX_SAMPLE_POINTS`] are refused before anything is allocated.
pub fn mesh(bbox: &BoundingBox, density: u32) -> Result<Vec<SamplePoint>, GridError> {
    if density == 0 {
        return Err(GridError::ZeroDensity);
    }
    if !bbox.is_finite() {
        return Err(GridError::NonFinite);
    }

    let n = density as u64 + 1;
    let requested = n.saturating_mul(n);
    if requested > MAX_SAMPLE_POINTS as u64 {
        return Err(GridError::TooManyPoints {
            requested,
            limit: MAX_SAMPLE_POINTS,
        });
    }
    let mut points = Vec::with_capacity(requested as usize);
    for i in 0..=density {
        let lng = interpolate(bbox.lng2, bbox.lng1, i, density);
        for j in 0..=density {
            let lat = interpolate(bbox.lat2, bbox.lat1, j, density);
            points.push(SamplePoint::new(lat, lng));
        }
    }
    Ok(points)
}

#[inline]
fn interpolate(from: f64, to: f64, k: u32, density: u32) -> f64 {
    if k == density {
        // avoid accumulated rounding on the far corner
        return to;
    }
    let step = (to - from) / density as f64;
    from + k as f64 * step
}

/// Parses `lat,lng:lat,lng:...`. Blank segments are skipped and duplicates dropped,
/// keeping the first occurrence so repeated runs sample in the same order.
pub fn parse_point_list(text: &str) -> Result<Vec<SamplePoint>, GridError> {
    let mut seen = HashSet::new();
    let mut points = Vec::new();

    for segment in text.split(':').map(str::trim).filter(|s| !s.is_empty()) {
        let point = parse_point(segment)?;
        if points.len() == MAX_SAMPLE_POINTS {
            return Err(GridError::TooManyPoints {
                requested: points.len() as u64 + 1,
                limit: MAX_SAMPLE_POINTS,
            });
        }
        // -0.0 and 0.0 must collapse to the same key
        let key = ((point.lat + 0.0).to_bits(), (point.lng + 0.0).to_bits());
        if seen.insert(key) {
            points.push(point);
        }
    }

    if points.is_empty() {
        return Err(GridError::Empty);
    }
    Ok(points)
}

fn parse_point(segment: &str) -> Result<SamplePoint, GridError> {
    let bad = || GridError::BadPoint(segment.to_owned());
    let (lat, lng) = segment.split_once(',').ok_or_else(bad)?;
    let lat: f64 = lat.trim().parse().map_err(|_| bad())?;
    let lng: f64 = lng.trim().parse().map_err(|_| bad())?;
    let point = SamplePoint::new(lat, lng);
    if !point.is_finite() {
        return Err(bad());
    }
    Ok(point)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_box_density_one_yields_the_four_corners() {
        let bbox = BoundingBox::new(1.0, 1.0, 0.0, 0.0);
        let points = mesh(&bbox, 1).unwrap();
        assert_eq!(
            points,
            vec![
                SamplePoint::new(0.0, 0.0),
                SamplePoint::new(1.0, 0.0),
                SamplePoint::new(0.0, 1.0),
                SamplePoint::new(1.0, 1.0),
            ]
        );
    }

    #[test]
    fn mesh_size_and_corners_for_awkward_steps() {
        let bbox = BoundingBox::new(51.5101, -0.1201, 51.5003, -0.1377);
        for density in 1..=9 {
            let points = mesh(&bbox, density).unwrap();
            let n = density as usize + 1;
            assert_eq!(points.len(), n * n);

            let near = SamplePoint::new(bbox.lat2, bbox.lng2);
            let far = SamplePoint::new(bbox.lat1, bbox.lng1);
            assert_eq!(points.iter().filter(|p| **p == near).count(), 1);
            assert_eq!(points.iter().filter(|p| **p == far).count(), 1);
        }
    }

    #[test]
    fn zero_density_is_rejected() {
        let bbox = BoundingBox::new(1.0, 1.0, 0.0, 0.0);
        assert_eq!(mesh(&bbox, 0), Err(GridError::ZeroDensity));
    }

    #[test]
    fn non_finite_box_is_rejected() {
        let bbox = BoundingBox::new(f64::NAN, 1.0, 0.0, 0.0);
        assert_eq!(mesh(&bbox, 2), Err(GridError::NonFinite));
    }

    #[test]
    fn point_list_deduplicates_and_keeps_first_order() {
        let points = parse_point_list(" 1.5,2.5 :3,4:1.5,2.5::\n-0.0,0\n:0,0").unwrap();
        assert_eq!(
            points,
            vec![
                SamplePoint::new(1.5, 2.5),
                SamplePoint::new(3.0, 4.0),
                SamplePoint::new(-0.0, 0.0),
            ]
        );
    }

    #[test]
    fn point_list_rejects_garbage() {
        assert_eq!(
            parse_point_list("1,2:nope"),
            Err(GridError::BadPoint("nope".into()))
        );
        assert_eq!(parse_point_list(" : "), Err(GridError::Empty));
        assert!(matches!(parse_point_list("1,inf"), Err(GridError::BadPoint(_))));
    }

    #[test]
    fn oversized_meshes_are_refused_up_front() {
        let bbox = BoundingBox::new(1.0, 1.0, 0.0, 0.0);
        assert_eq!(
            mesh(&bbox, 3_000_000),
            Err(GridError::TooManyPoints {
                requested: 3_000_001 * 3_000_001,
                limit: MAX_SAMPLE_POINTS,
            })
        );
        assert!(matches!(mesh(&bbox, u32::MAX), Err(GridError::TooManyPoints { .. })));

        let largest = (MAX_SAMPLE_POINTS as f64).sqrt() as u32 - 1;
        assert_eq!(mesh(&bbox, largest).unwrap().len(), (largest as usize + 1).pow(2));
    }

    #[test]
    fn oversized_point_lists_are_refused() {
        let text: String = (0..=MAX_SAMPLE_POINTS).map(|i| format!("{i},0:")).collect();
        assert!(matches!(parse_point_list(&text), Err(GridError::TooManyPoints { .. })));

        let many = vec![SamplePoint::new(0.0, 0.0); MAX_SAMPLE_POINTS + 1];
        assert!(matches!(
            SampleSource::List(many).points(),
            Err(GridError::TooManyPoints { .. })
        ));
    }
}
