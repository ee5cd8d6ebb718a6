//! Per-tile match counts and the bearing-intersection estimate built from them.
//!
//! Each tile looks along a known heading from a known point. The two best-matching
//! tiles with usable bearings define two rays, and the photo subject sits where
//! they cross.

use crate::geo::LatLng;
use crate::tile::TileKey;
use std::fmt::Write;
use thiserror::Error;

pub const MATCH_CSV_HEADER: &str = "LAT,LNG,HEADING,PITCH,#MATCHES";

/// Fewer matches than this on both of a candidate pair means the subject was not found.
pub const MIN_MATCHES: u32 = 10;

/// How many of the best tiles are considered for the intersection.
pub const TOP_CANDIDATES: usize = 10;

#[derive(Debug, Error, PartialEq)]
pub enum MatchTableError {
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileMatch {
    pub key: TileKey,
    pub matches: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchTable {
    rows: Vec<TileMatch>,
}

impl MatchTable {
    pub fn new(rows: Vec<TileMatch>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[TileMatch] {
        &self.rows
    }

    /// Accepts `lat,lng,heading,pitch,matches` rows and the older four-column
    /// `lat,lng,heading,matches` form (pitch taken as 0). Header lines are skipped.
    pub fn parse_csv(text: &str) -> Result<Self, MatchTableError> {
        let mut rows = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with("LAT,") {
                continue;
            }
            let malformed = |reason: &str| MatchTableError::Malformed {
                line: idx + 1,
                reason: reason.to_owned(),
            };
            let cols: Vec<&str> = line.split(',').map(str::trim).collect();
            let (stem, matches) = match cols.len() {
                5 => (cols[..4].join(","), cols[4]),
                4 => (format!("{},{},{},0", cols[0], cols[1], cols[2]), cols[3]),
                _ => return Err(malformed("expected 4 or 5 columns")),
            };
            let key = TileKey::parse_stem(&stem).ok_or_else(|| malformed("bad tile coordinates"))?;
            let matches = matches.parse().map_err(|_| malformed("bad match count"))?;
            rows.push(TileMatch { key, matches });
        }
        Ok(Self { rows })
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::with_capacity(32 * (self.rows.len() + 1));
        out.push_str(MATCH_CSV_HEADER);
        out.push('\n');
        for row in &self.rows {
            let _ = writeln!(out, "{},{}", row.key.stem(), row.matches);
        }
        out
    }

    /// Ranks tiles by match count and intersects the bearings of consecutive
    /// candidates until one pair yields a finite point.
    pub fn locate(&self) -> Option<LatLng> {
        let mut ranked = self.rows.clone();
        ranked.sort_by(|a, b| b.matches.cmp(&a.matches));
        ranked.truncate(TOP_CANDIDATES);

        for pair in ranked.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.matches < MIN_MATCHES && b.matches < MIN_MATCHES {
                tracing::debug!(best = a.matches, "Not enough matches to locate");
                return None;
            }
            if let Some(found) = bearing_intersection(
                a.key.point,
                a.key.heading as f64,
                b.key.point,
                b.key.heading as f64,
            ) {
                return Some(found);
            }
        }
        None
    }
}

/// Below this the two bearings count as parallel.
const PARALLEL_EPSILON: f64 = 1e-12;

/// Crossing point of two rays given by origin and compass heading (degrees,
/// clockwise from north). Works in the plane x = lng, y = lat; truncated to 1e-10°.
/// Parallel or anti-parallel rays, and lines that only cross behind a camera,
/// give `None`.
pub fn bearing_intersection(p1: LatLng, heading1: f64, p2: LatLng, heading2: f64) -> Option<LatLng> {
    let (x1, y1) = (p1.lng, p1.lat);
    let (x2, y2) = (p2.lng, p2.lat);
    let b1 = (90.0 - heading1).rem_euclid(360.0).to_radians();
    let b2 = (90.0 - heading2).rem_euclid(360.0).to_radians();
    let (dx, dy) = (x2 - x1, y2 - y1);

    let denom = b1.cos() * b2.sin() - b1.sin() * b2.cos();
    if denom.abs() < PARALLEL_EPSILON {
        return None;
    }
    // distances along each ray
    let a = (dx * b2.sin() - dy * b2.cos()) / denom;
    let c = (dx * b1.sin() - dy * b1.cos()) / denom;
    if a < 0.0 || c < 0.0 {
        return None;
    }

    let x3 = truncate(x1 + a * b1.cos());
    let y3 = truncate(y1 + a * b1.sin());
    let found = LatLng::new(y3, x3);
    found.is_finite().then_some(found)
}

#[inline]
fn truncate(v: f64) -> f64 {
    (v * 1e10).floor() / 1e10
}
