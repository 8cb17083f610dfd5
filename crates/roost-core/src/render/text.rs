//! Cell-width aware text helpers.

use unicode_segmentation::UnicodeSegmentation;
use unicode_width::UnicodeWidthStr;

const ELLIPSIS: char = '…';

/// Display width of `s` in terminal cells, summed per grapheme cluster.
pub fn display_width(s: &str) -> usize {
    s.graphemes(true).map(UnicodeWidthStr::width).sum()
}

/// Clip `s` to at most `max` cells.
///
/// Control characters are dropped so caller-supplied strings can never
/// inject escape sequences. A double-width character that would straddle
/// the limit is left out entirely, and clipped text ends in `…`. Cuts
/// fall on grapheme cluster boundaries, so emoji presentation and ZWJ
/// sequences stay whole.
pub fn clip(s: &str, max: usize) -> String {
    let clean: String = s.chars().filter(|c| !c.is_control()).collect();
    if display_width(&clean) <= max {
        return clean;
    }
    if max == 0 {
        return String::new();
    }

    let budget = max - 1;
    let mut out = String::new();
    let mut used = 0;
    for cluster in clean.graphemes(true) {
        let w = UnicodeWidthStr::width(cluster);
        if used + w > budget {
            break;
        }
        used += w;
        out.push_str(cluster);
    }
    out.push(ELLIPSIS);
    out
}

/// Join `items` with `", "`, showing at most `cap` and a `+N more` suffix.
pub fn capped_list(items: &[String], cap: usize) -> String {
    if items.is_empty() {
        return "none".to_string();
    }
    let shown = items
        .iter()
        .take(cap)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if items.len() > cap {
        format!("{shown} +{} more", items.len() - cap)
    } else {
        shown
    }
}
