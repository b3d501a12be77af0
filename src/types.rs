//! Result types shared by planning and materialization.
//!
//! A [`Stat`] starts life *planned* (everything but `size` known) and becomes
//! *materialized* once its bytes exist, on disk or in memory. The transition
//! returns a new value; a planned stat is never patched in place.

use crate::format::ImageFormat;
use crate::imaging::backend::Probe;
use crate::imaging::calculations::is_quarter_turn;
use bytes::Bytes;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::path::PathBuf;

/// One output artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stat {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub url: String,
    /// MIME type of the output.
    pub source_type: String,
    /// `"{url} {width}w"`
    pub srcset: String,
    /// Absent when a URL hook is installed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    /// Byte size, known once materialized (SVG sizes are known when planned).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Encoded bytes, kept under dry-run or when there is no output path.
    #[serde(skip)]
    pub buffer: Option<Bytes>,
}

impl Stat {
    /// The same stat with its bytes accounted for.
    pub fn materialized(self, size: u64, buffer: Option<Bytes>) -> Self {
        Self {
            size: Some(size),
            buffer,
            ..self
        }
    }
}

/// Dimensions and format of a source as the planner sees them.
///
/// Width and height are *display* dimensions: already swapped for EXIF
/// orientations that rotate by a quarter turn, and reduced to one page for
/// multi-page sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMetadata {
    pub width: u32,
    pub height: u32,
    /// `None` when planning from dimensions alone.
    pub format: Option<ImageFormat>,
    pub orientation: Option<u8>,
}

impl SourceMetadata {
    pub fn from_probe(probe: Probe) -> Self {
        let height = probe.page_height.unwrap_or(probe.height);
        let (width, height) = if is_quarter_turn(probe.orientation) {
            (height, probe.width)
        } else {
            (probe.width, height)
        };
        Self {
            width,
            height,
            format: Some(probe.format),
            orientation: probe.orientation,
        }
    }

    pub fn from_dimensions(width: u32, height: u32, format: Option<ImageFormat>) -> Self {
        Self {
            width,
            height,
            format,
            orientation: None,
        }
    }

    pub fn is_svg(&self) -> bool {
        self.format == Some(ImageFormat::Svg)
    }
}

/// Stats grouped by format.
///
/// Groups keep the resolved format order; each group is ascending by width,
/// which is the order `srcset` wants. Serializes as a JSON object keyed by
/// format name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FullStatsPlan {
    groups: Vec<(ImageFormat, Vec<Stat>)>,
}

impl FullStatsPlan {
    /// Group `stats` by format in `order`. Formats with no stats are omitted.
    pub fn from_stats(order: &[ImageFormat], stats: Vec<Stat>) -> Self {
        let mut groups: Vec<(ImageFormat, Vec<Stat>)> =
            order.iter().map(|&format| (format, Vec::new())).collect();
        for stat in stats {
            match groups.iter_mut().find(|(format, _)| *format == stat.format) {
                Some((_, group)) => group.push(stat),
                None => groups.push((stat.format, vec![stat])),
            }
        }
        groups.retain(|(_, group)| !group.is_empty());
        for (_, group) in &mut groups {
            group.sort_by_key(|stat| stat.width);
        }
        Self { groups }
    }

    pub fn get(&self, format: ImageFormat) -> Option<&[Stat]> {
        self.groups
            .iter()
            .find(|(f, _)| *f == format)
            .map(|(_, stats)| stats.as_slice())
    }

    pub fn formats(&self) -> impl Iterator<Item = ImageFormat> + '_ {
        self.groups.iter().map(|(format, _)| *format)
    }

    pub fn groups(&self) -> impl Iterator<Item = (ImageFormat, &[Stat])> {
        self.groups
            .iter()
            .map(|(format, stats)| (*format, stats.as_slice()))
    }

    /// All stats, group by group.
    pub fn stats(&self) -> impl Iterator<Item = &Stat> {
        self.groups.iter().flat_map(|(_, stats)| stats)
    }

    pub fn into_stats(self) -> Vec<Stat> {
        self.groups.into_iter().flat_map(|(_, stats)| stats).collect()
    }

    /// Total number of stats.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|(_, stats)| stats.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Replace raster outputs that are larger than the SVG output.
    ///
    /// In each non-SVG group the first stat whose size exceeds the SVG's is
    /// replaced by the SVG stat and the other larger stats are dropped.
    /// Stats no larger than the SVG stay where they are, even after the
    /// substitution. A group where every stat is larger ends up holding only
    /// the SVG stat. Stats without a known size are never considered larger.
    ///
    /// The SVG stat keeps its own width and takes the slot of the stat it
    /// replaces, so the group may no longer be ascending by width.
    pub fn apply_size_short_circuit(&mut self) {
        let Some(svg) = self
            .get(ImageFormat::Svg)
            .and_then(|stats| stats.first())
            .cloned()
        else {
            return;
        };
        let Some(svg_size) = svg.size else {
            return;
        };

        for (format, stats) in &mut self.groups {
            if format.is_svg() {
                continue;
            }
            let mut substituted = false;
            let kept = std::mem::take(stats)
                .into_iter()
                .filter_map(|stat| {
                    if !stat.size.is_some_and(|size| size > svg_size) {
                        Some(stat)
                    } else if substituted {
                        None
                    } else {
                        substituted = true;
                        Some(svg.clone())
                    }
                })
                .collect();
            *stats = kept;
        }
    }
}

impl Serialize for FullStatsPlan {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.groups.len()))?;
        for (format, stats) in &self.groups {
            map.serialize_entry(format, stats)?;
        }
        map.end()
    }
}
