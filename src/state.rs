//! Shared constants and small state types.
//!
//! Policy defaults used by [`crate::config::BrowserConfig`], the trace color
//! palettes and the background loading state reported by the session.

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of channels that can be selected simultaneously
pub const MAX_CHANNELS: usize = 10;

/// Default number of points a query is asked for (roughly one per pixel)
pub const MAX_CHART_POINTS: usize = 2000;

/// Children merged into one bucket of the next resolution tier
pub const DEFAULT_AGGREGATION_RATIO: usize = 4;

/// Query results may exceed the target point count by this factor before
/// neighbouring buckets are merged
pub const DEFAULT_POINT_BUDGET_FACTOR: usize = 2;

/// Color palette for traces
pub const CHART_COLORS: &[[u8; 3]] = &[
    [113, 120, 78],  // Olive green
    [191, 78, 48],   // Rust orange
    [71, 108, 155],  // Blue
    [159, 166, 119], // Sage green
    [253, 193, 73],  // Amber
    [135, 30, 28],   // Dark red
    [246, 247, 235], // Cream
    [100, 149, 237], // Cornflower blue
    [255, 127, 80],  // Coral
    [144, 238, 144], // Light green
];

/// Colorblind-friendly palette (Wong)
pub const COLORBLIND_COLORS: &[[u8; 3]] = &[
    [0, 114, 178],   // Blue
    [230, 159, 0],   // Orange
    [0, 158, 115],   // Bluish green
    [204, 121, 167], // Reddish purple
    [86, 180, 233],  // Sky blue
    [213, 94, 0],    // Vermillion
    [240, 228, 66],  // Yellow
    [0, 0, 0],       // Black
    [136, 204, 238], // Light blue
    [153, 153, 153], // Gray
];

/// RGB color for a palette index, wrapping around the palette
pub fn palette_color(index: usize, colorblind: bool) -> [u8; 3] {
    let palette = if colorblind { COLORBLIND_COLORS } else { CHART_COLORS };
    palette[index % palette.len()]
}

// ============================================================================
// Loading
// ============================================================================

/// Current state of background loading
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LoadingState {
    /// No loading in progress
    #[default]
    Idle,
    /// Loading sources (display names of the sources in flight)
    Loading(Vec<String>),
}

impl LoadingState {
    pub fn is_loading(&self) -> bool {
        matches!(self, LoadingState::Loading(_))
    }
}
