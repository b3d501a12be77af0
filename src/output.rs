//! CLI output formatting.
//!
//! Output is grouped the way `<picture>` markup consumes it: one block per
//! format, in output order, with one line per width. Each line leads with the
//! `srcset` descriptor and shows the URL and, once materialized, the size.
//! The local output path follows as an indented context line when there is
//! one.
//!
//! ```text
//! photo.jpg (1280x853)
//!     webp image/webp
//!         640w  /img/5P3yLKp7Ra-640.webp  41.2 KB
//!             img/5P3yLKp7Ra-640.webp
//!         1280w /img/5P3yLKp7Ra-1280.webp 118.0 KB
//!             img/5P3yLKp7Ra-1280.webp
//! ```
//!
//! Each display has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure: no I/O, no side effects.

use crate::types::FullStatsPlan;
use serde_json::{Value, json};

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// Human-readable byte count.
fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{bytes} B")
    } else if b < KB * KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{:.1} MB", b / (KB * KB))
    }
}

/// Format one derived plan under a header naming its source.
pub fn format_plan(src: &str, plan: &FullStatsPlan) -> Vec<String> {
    let mut lines = Vec::new();

    let header = plan
        .stats()
        .max_by_key(|s| s.width)
        .map(|s| format!("{src} ({}x{})", s.width, s.height))
        .unwrap_or_else(|| format!("{src} (no outputs)"));
    lines.push(header);

    let descriptor_width = plan
        .stats()
        .map(|s| format!("{}w", s.width).len())
        .max()
        .unwrap_or(0);

    for (format, stats) in plan.groups() {
        let mime = stats.first().map(|s| s.source_type.as_str()).unwrap_or("");
        lines.push(format!("{}{} {}", indent(1), format, mime));
        for stat in stats {
            let descriptor = format!("{}w", stat.width);
            let mut line = format!(
                "{}{:<descriptor_width$} {}",
                indent(2),
                descriptor,
                stat.url
            );
            if stat.format != format {
                line.push_str(&format!(" ({})", stat.format));
            }
            if let Some(size) = stat.size {
                line.push(' ');
                line.push_str(&format_size(size));
            }
            lines.push(line);
            if let Some(path) = &stat.output_path {
                lines.push(format!("{}{}", indent(3), path.display()));
            }
        }
    }
    lines
}

pub fn print_plan(src: &str, plan: &FullStatsPlan) {
    for line in format_plan(src, plan) {
        println!("{}", line);
    }
}

/// Plans as a JSON array of `{"src", "stats"}` objects, in input order.
pub fn plans_json(plans: &[(&str, FullStatsPlan)]) -> Value {
    Value::Array(
        plans
            .iter()
            .map(|(src, plan)| json!({ "src": src, "stats": plan }))
            .collect(),
    )
}

/// One-line summary after a batch of derivations.
///
/// ```text
/// Derived 3 sources, 12 outputs (3 derived)
/// Derived 3 sources, 12 outputs (2 derived, 1 coalesced (3 total)), 1 failed
/// ```
pub fn format_summary(
    sources: usize,
    outputs: usize,
    failed: usize,
    dedup: &crate::cache::DedupStats,
) -> String {
    let mut line = format!(
        "Derived {} source{}, {} output{} ({})",
        sources,
        if sources == 1 { "" } else { "s" },
        outputs,
        if outputs == 1 { "" } else { "s" },
        dedup
    );
    if failed > 0 {
        line.push_str(&format!(", {failed} failed"));
    }
    line
}
