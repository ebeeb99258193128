//! Path normalization shared by directory lookup and iteration: splits a
//! `/`- or `\`-separated path into components, collapsing empty segments
//! produced by leading, trailing or doubled separators.

/// Splits a path into components. Backslashes are accepted as separators
/// alongside `/`, duplicate separators collapse, and a trailing separator
/// is dropped.
pub fn normalize(path: &str) -> Vec<String> {
    path.split(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/') || path.starts_with('\\')
}

pub fn parent_and_name(path: &str) -> Option<(Vec<String>, String)> {
    let mut components = normalize(path);
    let name = components.pop()?;
    Some((components, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_empty_segments() {
        assert_eq!(normalize("/a//b/c/"), vec!["a", "b", "c"]);
        assert_eq!(normalize(""), Vec::<String>::new());
    }

    #[test]
    fn treats_backslashes_as_separators() {
        assert_eq!(normalize(r"\a\b\c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn splits_parent_and_name() {
        let (parent, name) = parent_and_name("/a/b/c").unwrap();
        assert_eq!(parent, vec!["a", "b"]);
        assert_eq!(name, "c");
    }

    #[test]
    fn root_path_has_no_name() {
        assert!(parent_and_name("/").is_none());
    }
}
