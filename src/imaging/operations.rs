//! High-level image operations.
//!
//! These functions combine calculations with backend execution: they turn a
//! probed source plus [`Options`] into a stat plan, turn one planned stat
//! into [`TranscodeParams`], and produce its bytes.

use super::backend::{BackendError, CodecBackend};
use super::calculations::{aspect_height, is_quarter_turn, resolve_formats, resolve_widths};
use super::params::{Transform, TranscodeParams};
use crate::config::{Hooks, Options, SvgShortCircuit};
use crate::naming::build_stat;
use crate::process::DeriveError;
use crate::types::{FullStatsPlan, SourceMetadata, Stat};
use tracing::debug;

/// Plan every output for one source.
///
/// `hash` is `None` only when a URL hook makes it unnecessary. `svg_size` is
/// the reported size of the source itself, attached to an `svg` output.
pub fn build_plan(
    meta: &SourceMetadata,
    hash: Option<&str>,
    src: &str,
    svg_size: Option<u64>,
    options: &Options,
) -> Result<FullStatsPlan, DeriveError> {
    let formats = resolve_formats(&options.formats, meta.format, options.svg_short_circuit)?;
    let allow_upscale = meta.is_svg() && options.svg_allow_upscale;
    let widths = resolve_widths(
        meta.width,
        &options.widths,
        allow_upscale,
        options.minimum_threshold,
    );

    let mut stats = Vec::new();
    for &format in &formats {
        if format.is_svg() {
            if !meta.is_svg() {
                debug!(src, "skipping svg output for a raster source");
                continue;
            }
            let mut stat = build_stat(hash, src, meta.width, meta.height, format, options);
            stat.size = svg_size;
            stats.push(stat);
            if options.svg_short_circuit == SvgShortCircuit::On {
                debug!(src, "svg short-circuit: raster outputs skipped");
                break;
            }
            continue;
        }
        for &width in &widths {
            let height = aspect_height(width, meta.width, meta.height);
            stats.push(build_stat(hash, src, width, height, format, options));
        }
    }

    Ok(FullStatsPlan::from_stats(&formats, stats))
}

/// Transforms and encoder settings for one planned output.
///
/// Orientation is fixed when asked for, and always for quarter turns (the
/// planned dimensions are already swapped). Sources are only resized when
/// the target is narrower, except SVG sources with upscaling allowed.
/// The `transform` hook sees the result last.
pub fn plan_transcode(stat: &Stat, meta: &SourceMetadata, options: &Options) -> TranscodeParams {
    let mut params = TranscodeParams::new(stat.format, &options.codec);

    if options.fix_orientation || is_quarter_turn(meta.orientation) {
        params.transforms.push(Transform::AutoOrient);
    }

    let enlarge_svg = meta.is_svg() && options.svg_allow_upscale;
    if stat.width < meta.width || (enlarge_svg && stat.width != meta.width) {
        params.transforms.push(Transform::Resize {
            width: stat.width,
            allow_enlarge: enlarge_svg,
        });
    }

    if let Some(hook) = &options.hooks.transform {
        (hook.func())(&mut params);
    }
    params
}

/// Produce the bytes of one output.
///
/// A format hook registered for the target format replaces the codec.
pub fn produce(
    backend: &dyn CodecBackend,
    source: &[u8],
    params: &TranscodeParams,
    hooks: &Hooks,
) -> Result<Vec<u8>, BackendError> {
    match hooks.format.get(&params.format) {
        Some(hook) => (hook.func())(source).map_err(|reason| {
            BackendError::ProcessingFailed(format!(
                "{} hook `{}` failed: {reason}",
                params.format,
                hook.name()
            ))
        }),
        None => backend.transcode(source, params),
    }
}
