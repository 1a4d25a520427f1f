//! Common file patterns used when collecting notes for indexing.

/// Extensions treated as Markdown by default.
pub fn markdown_extensions() -> Vec<String> {
    vec!["md".to_string(), "markdown".to_string()]
}

/// Default directory names skipped during collection.
///
/// Only version control, note-app metadata and dependency trees; a notes
/// folder called `build` or `vendor` is still indexed.
pub fn default_exclude_patterns() -> Vec<String> {
    vec![
        // Version control
        ".git".to_string(),
        ".svn".to_string(),
        ".hg".to_string(),

        // Note apps
        ".obsidian".to_string(),
        ".trash".to_string(),

        // Package managers
        "node_modules".to_string(),
    ]
}

/// Check if a path should be skipped based on exclude patterns.
///
/// A path is excluded when any of its components equals one of the patterns.
/// Whole-component matching keeps `about.md` from being caught by `out`.
pub fn should_exclude(path: &std::path::Path, exclude_patterns: &[String]) -> bool {
    path.components().any(|component| {
        let name = component.as_os_str().to_string_lossy();
        exclude_patterns.iter().any(|pattern| name == pattern.as_str())
    })
}

/// Checks the file extension against `extensions`, ignoring case.
pub fn has_extension(path: &std::path::Path, extensions: &[String]) -> bool {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => extensions
            .iter()
            .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(ext)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_should_exclude_git() {
        let path = PathBuf::from("/home/user/notes/.git/config");
        let patterns = default_exclude_patterns();
        assert!(should_exclude(&path, &patterns));
    }

    #[test]
    fn test_should_exclude_node_modules() {
        let path = PathBuf::from("/home/user/notes/node_modules/pkg/README.md");
        let patterns = default_exclude_patterns();
        assert!(should_exclude(&path, &patterns));
    }

    #[test]
    fn test_build_style_folders_not_excluded_by_default() {
        let patterns = default_exclude_patterns();
        for dir in ["build", "dist", "target", "vendor", "venv"] {
            let path = PathBuf::from(format!("notes/{dir}/page.md"));
            assert!(!should_exclude(&path, &patterns), "{dir} should be indexed");
        }
    }

    #[test]
    fn test_should_not_exclude_substring_matches() {
        let patterns = vec!["out".to_string(), "build".to_string()];
        assert!(!should_exclude(&PathBuf::from("notes/about.md"), &patterns));
        assert!(!should_exclude(&PathBuf::from("notes/rebuilding.md"), &patterns));
        assert!(should_exclude(&PathBuf::from("notes/build/x.md"), &patterns));
    }

    #[test]
    fn test_has_extension() {
        let extensions = markdown_extensions();
        assert!(has_extension(&PathBuf::from("a.md"), &extensions));
        assert!(has_extension(&PathBuf::from("A.MD"), &extensions));
        assert!(has_extension(&PathBuf::from("b.markdown"), &extensions));
        assert!(!has_extension(&PathBuf::from("c.txt"), &extensions));
        assert!(!has_extension(&PathBuf::from("README"), &extensions));
        assert!(has_extension(&PathBuf::from("d.md"), &[".md".to_string()]));
    }
}
