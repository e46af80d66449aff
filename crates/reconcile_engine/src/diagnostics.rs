//! Hints for search text that failed to match.

use similar::TextDiff;

/// Region of the content most similar to a search block.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosestRegion {
    /// One-based first line.
    pub start_line: usize,
    /// One-based last line, inclusive.
    pub end_line: usize,
    pub similarity: f32,
    pub text: String,
}

const MIN_SIMILARITY: f32 = 0.5;

/// Slides a window of the search's height over `content` and returns the
/// most similar region, if any clears the similarity floor.
#[must_use]
pub fn closest_region(content: &str, search: &str) -> Option<ClosestRegion> {
    let height = search.lines().count();
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    if height == 0 || lines.len() < height {
        return None;
    }

    let mut best: Option<ClosestRegion> = None;
    for start in 0..=lines.len() - height {
        let text: String = lines[start..start + height].concat();
        let similarity = TextDiff::from_lines(search, text.as_str()).ratio();
        let improves = match &best {
            Some(current) => similarity > current.similarity,
            None => true,
        };
        if improves {
            best = Some(ClosestRegion {
                start_line: start + 1,
                end_line: start + height,
                similarity,
                text,
            });
        }
    }

    best.filter(|region| region.similarity >= MIN_SIMILARITY)
}

/// Human-readable explanation of why `search` did not match, suitable for
/// feeding back to the model.
#[must_use]
pub fn describe_mismatch(content: &str, search: &str) -> String {
    let Some(region) = closest_region(content, search) else {
        return "The search block does not resemble any part of the file. Re-read the file and copy the lines exactly.".to_string();
    };

    let diff = TextDiff::from_lines(search, region.text.as_str())
        .unified_diff()
        .context_radius(2)
        .header(
            "search",
            &format!("file lines {}-{}", region.start_line, region.end_line),
        )
        .to_string();

    format!(
        "The closest region is lines {}-{} ({:.0}% similar):\n{diff}",
        region.start_line,
        region.end_line,
        region.similarity * 100.0
    )
}
