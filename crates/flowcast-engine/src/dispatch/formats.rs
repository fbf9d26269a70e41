use flowcast_core::types::{AdFormat, NodeType};

/// Aspect ratios the generation collaborator accepts.
pub const SUPPORTED_RATIOS: &[(&str, f64)] = &[
    ("1:1", 1.0),
    ("3:4", 3.0 / 4.0),
    ("4:3", 4.0 / 3.0),
    ("9:16", 9.0 / 16.0),
    ("16:9", 16.0 / 9.0),
];

/// Nearest supported ratio to a pixel size, compared on a log scale so that
/// 2:1 and 1:2 are equally far from 1:1.
pub fn closest_aspect_ratio(width: u32, height: u32) -> &'static str {
    let target = (width.max(1) as f64 / height.max(1) as f64).ln();
    SUPPORTED_RATIOS
        .iter()
        .min_by(|(_, a), (_, b)| {
            (a.ln() - target)
                .abs()
                .total_cmp(&(b.ln() - target).abs())
        })
        .map(|(label, _)| *label)
        .unwrap_or("1:1")
}

/// Standard display placements used when an ad-format node lists none.
pub fn default_ad_formats() -> Vec<AdFormat> {
    vec![
        AdFormat::new("medium_rectangle", "Medium Rectangle", 300, 250),
        AdFormat::new("leaderboard", "Leaderboard", 728, 90),
        AdFormat::new("wide_skyscraper", "Wide Skyscraper", 160, 600),
        AdFormat::new("half_page", "Half Page", 300, 600),
        AdFormat::new("billboard", "Billboard", 970, 250),
        AdFormat::new("mobile_banner", "Mobile Banner", 320, 50),
        AdFormat::new("square_post", "Square Post", 1080, 1080),
        AdFormat::new("landscape_link", "Landscape Link", 1200, 628),
    ]
}

/// Vertical social placements used when a vertical-suite node lists none.
pub fn default_vertical_formats() -> Vec<AdFormat> {
    vec![
        AdFormat::new("story", "Story", 1080, 1920),
        AdFormat::new("portrait_feed", "Portrait Feed", 1080, 1350),
        AdFormat::new("pin", "Pin", 1000, 1500),
        AdFormat::new("classic_portrait", "Classic Portrait", 1080, 1440),
    ]
}

/// Formats a fan-out node will fill: its own list, or the catalogue for its type.
pub fn formats_for(node_type: NodeType, configured: &[AdFormat]) -> Vec<AdFormat> {
    if !configured.is_empty() {
        return configured.to_vec();
    }
    match node_type {
        NodeType::VerticalSuite => default_vertical_formats(),
        _ => default_ad_formats(),
    }
}
