//! Sentinel extracted-value strings.
//!
//! The extraction executor (§4.9) never fails a field outright; instead it
//! records one of these sentinels in place of a real value, and the job
//! continues. See [`crate::extraction`].

pub const NOT_FOUND: &str = "Not Found";
pub const SERVICE_UNAVAILABLE: &str = "Service Unavailable";
pub const INVALID_FORMAT: &str = "Invalid Format";

/// Normalize a raw LLM extraction response per §4.9:
/// trim whitespace, collapse newlines, fold any occurrence of "Not Found"
/// to exactly that string, and treat anything shorter than 2 characters as
/// "Not Found".
pub fn normalize_extracted_value(raw: &str) -> String {
    let collapsed: String = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let trimmed = collapsed.trim();

    if trimmed.contains(NOT_FOUND) {
        return NOT_FOUND.to_string();
    }
    if trimmed.chars().count() < 2 {
        return NOT_FOUND.to_string();
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_collapses_newlines() {
        assert_eq!(
            normalize_extracted_value("  \n  42 mg\n\n  once daily \n"),
            "42 mg once daily"
        );
    }

    #[test]
    fn folds_any_not_found_occurrence() {
        assert_eq!(
            normalize_extracted_value("The answer is Not Found in the provided context."),
            NOT_FOUND
        );
    }

    #[test]
    fn short_results_become_not_found() {
        assert_eq!(normalize_extracted_value("x"), NOT_FOUND);
        assert_eq!(normalize_extracted_value(""), NOT_FOUND);
    }

    #[test]
    fn ordinary_value_passes_through() {
        assert_eq!(normalize_extracted_value("2024-03-15"), "2024-03-15");
    }
}
