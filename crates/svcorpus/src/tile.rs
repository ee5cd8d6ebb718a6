use crate::geo::SamplePoint;
use std::fmt;

/// Identity of one fetched tile. The canonical filename is
/// `<lat>,<lng>,<heading>,<pitch>.<ext>`, and the feature engine keys on it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileKey {
    pub point: SamplePoint,
    pub heading: u32,
    pub pitch: i32,
}

impl TileKey {
    pub fn new(point: SamplePoint, heading: u32, pitch: i32) -> Self {
        Self { point, heading, pitch }
    }

    pub fn stem(&self) -> String {
        format!(
            "{},{},{},{}",
            self.point.lat, self.point.lng, self.heading, self.pitch
        )
    }

    pub fn filename(&self, extension: &str) -> String {
        format!("{}.{}", self.stem(), extension)
    }

    /// Inverse of [`TileKey::filename`]. Returns `None` for anything that is not a tile.
    pub fn parse(filename: &str, extension: &str) -> Option<Self> {
        let (stem, ext) = filename.rsplit_once('.')?;
        if !ext.eq_ignore_ascii_case(extension) {
            return None;
        }
        Self::parse_stem(stem)
    }

    pub fn parse_stem(stem: &str) -> Option<Self> {
        let mut parts = stem.split(',');
        let lat = parts.next()?.trim().parse().ok()?;
        let lng = parts.next()?.trim().parse().ok()?;
        let heading = parts.next()?.trim().parse().ok()?;
        let pitch = parts.next()?.trim().parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        let point = SamplePoint::new(lat, lng);
        point.is_finite().then_some(Self { point, heading, pitch })
    }
}

/// Headings swept per point: `0, theta, 2·theta, …` strictly below 360.
pub fn headings(theta: u32) -> impl Iterator<Item = u32> {
    let count = if theta == 0 { 0 } else { 360 / theta };
    (0..count).map(move |i| i * theta)
}

/// Filenames accepted for one point, handed to the feature engine as a
/// colon-joined list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileList(Vec<String>);

impl TileList {
    pub fn new(names: Vec<String>) -> Self {
        Self(names)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for TileList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(":"))
    }
}
