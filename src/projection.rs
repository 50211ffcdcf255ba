use crate::dto::ResultSet;
use serde::Serialize;

pub const DEFAULT_DISPLAY_COUNT: usize = 5;

/// Overlay marker for one plottable patch. `index` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Marker {
    pub index: usize,
    pub norm_x: f64,
    pub norm_y: f64,
}

/// Markers for the first `display_count` patches that carry a position, in result order.
pub fn project_markers(results: &ResultSet, display_count: usize) -> Vec<Marker> {
    results
        .top_patches
        .iter()
        .filter_map(|patch| patch.position())
        .take(display_count)
        .enumerate()
        .map(|(idx, (norm_x, norm_y))| Marker {
            index: idx + 1,
            norm_x,
            norm_y,
        })
        .collect()
}
