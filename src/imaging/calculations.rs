//! Pure policy functions deciding which (width, format) pairs to produce.
//!
//! All functions here are pure and testable without any I/O or images.

use crate::config::SvgShortCircuit;
use crate::format::{FormatRequest, ImageFormat, WidthRequest};
use crate::process::DeriveError;

/// Resolve requested formats into concrete output formats.
///
/// `Auto` entries become `native`; duplicates are dropped keeping the first
/// occurrence. Unless `svg_short_circuit` is [`SvgShortCircuit::Size`], an
/// `svg` entry is moved to the front (stable) so a vector source can stop
/// before any raster work is planned.
///
/// # Errors
/// [`DeriveError::UnsupportedFormat`] when an `Auto` entry is present but the
/// native format is unknown (dimension-only entry points).
///
/// # Examples
/// ```
/// # use responsive_images::imaging::resolve_formats;
/// # use responsive_images::{FormatRequest, ImageFormat, SvgShortCircuit};
/// let requested = FormatRequest::parse_list("jpg,webp").unwrap();
/// let formats = resolve_formats(&requested, Some(ImageFormat::Jpeg), SvgShortCircuit::Off).unwrap();
/// assert_eq!(formats, vec![ImageFormat::Jpeg, ImageFormat::Webp]);
/// ```
pub fn resolve_formats(
    requested: &[FormatRequest],
    native: Option<ImageFormat>,
    svg_short_circuit: SvgShortCircuit,
) -> Result<Vec<ImageFormat>, DeriveError> {
    let mut formats: Vec<ImageFormat> = Vec::with_capacity(requested.len());
    for request in requested {
        let format = match request {
            FormatRequest::Format(format) => *format,
            FormatRequest::Auto => native.ok_or_else(|| {
                DeriveError::UnsupportedFormat(
                    "`auto` formats need a known native format; list formats explicitly \
                     when planning from dimensions alone"
                        .into(),
                )
            })?,
        };
        if !formats.contains(&format) {
            formats.push(format);
        }
    }

    if svg_short_circuit != SvgShortCircuit::Size {
        formats.sort_by_key(|format| !format.is_svg());
    }
    Ok(formats)
}

/// Resolve requested widths against the source's native width.
///
/// - `Auto` (and `0`) become `native`.
/// - Without `allow_upscale`, a width above `native` collapses to `native`
///   only when the previous accepted width `w` is far enough below it
///   (`floor(w * minimum_threshold) <= native`); otherwise it is dropped so two
///   near-identical outputs are never emitted.
/// - The result is strictly ascending and never empty (`[native]` fallback).
///
/// # Examples
/// ```
/// # use responsive_images::imaging::resolve_widths;
/// # use responsive_images::WidthRequest;
/// let requested = [WidthRequest::Pixels(400), WidthRequest::Pixels(800)];
/// let widths = resolve_widths(500, &requested, false, 1.25);
/// assert_eq!(widths, vec![400, 500]);
/// ```
pub fn resolve_widths(
    native: u32,
    requested: &[WidthRequest],
    allow_upscale: bool,
    minimum_threshold: f64,
) -> Vec<u32> {
    let mut candidates: Vec<u32> = requested.iter().map(|w| w.or_native(native)).collect();
    candidates.sort_unstable();

    let mut accepted = Vec::with_capacity(candidates.len());
    let mut last_was_big_enough = true;
    for width in candidates {
        if width > native && !allow_upscale {
            if last_was_big_enough {
                accepted.push(native);
            }
            continue;
        }
        last_was_big_enough = (f64::from(width) * minimum_threshold).floor() <= f64::from(native);
        accepted.push(width);
    }

    accepted.sort_unstable();
    accepted.dedup();
    if accepted.is_empty() {
        accepted.push(native);
    }
    accepted
}

/// Height for `width` preserving the source aspect ratio.
pub fn aspect_height(width: u32, native_width: u32, native_height: u32) -> u32 {
    if width == native_width || native_width == 0 {
        return native_height;
    }
    let height = (f64::from(native_height) * f64::from(width) / f64::from(native_width)).round();
    (height as u32).max(1)
}

/// EXIF orientations 5–8 rotate the image by ±90°, swapping width and height.
pub fn is_quarter_turn(orientation: Option<u8>) -> bool {
    matches!(orientation, Some(5..=8))
}
