//! Naming helpers
//!
//! Resource names, step titles and build-ordinal comparison.

/// Step title for a container name
///
/// `build-step-run-unit-tests` becomes `Run Unit Tests`.
pub fn step_title(container_name: &str) -> String {
    let trimmed = container_name
        .strip_prefix("build-step-")
        .or_else(|| container_name.strip_prefix("step-"))
        .unwrap_or(container_name);

    trimmed
        .split('-')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lowercases `name` and replaces anything a resource name cannot hold with `-`
pub fn to_valid_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches(|c: char| c == '-' || c == '.').to_string()
}

/// Deterministic activity name for one build
pub fn activity_name(owner: &str, repository: &str, branch: &str, build: &str) -> String {
    to_valid_name(&format!("{owner}-{repository}-{branch}-{build}"))
}

/// Trailing run of ASCII digits, possibly empty
pub fn digit_suffix(text: &str) -> &str {
    let start = text
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(index, _)| index)
        .unwrap_or(text.len());
    &text[start..]
}

/// True if build `candidate` is numerically newer than build `other`
///
/// An unparsable candidate is never newer; a parsable candidate is always
/// newer than an unparsable one.
pub fn is_newer_build(candidate: &str, other: &str) -> bool {
    let Ok(candidate) = candidate.trim().parse::<u64>() else {
        return false;
    };
    match other.trim().parse::<u64>() {
        Ok(other) => candidate > other,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_title() {
        assert_eq!(step_title("build-step-run-unit-tests"), "Run Unit Tests");
        assert_eq!(step_title("step-git-merge"), "Git Merge");
        assert_eq!(step_title("git-source"), "Git Source");
        assert_eq!(step_title("install"), "Install");
    }

    #[test]
    fn test_to_valid_name() {
        assert_eq!(to_valid_name("Org-My_Repo-PR-12-3"), "org-my-repo-pr-12-3");
        assert_eq!(to_valid_name("feature/Fancy--thing"), "feature-fancy-thing");
        assert_eq!(activity_name("jstrachan", "demo", "master", "7"), "jstrachan-demo-master-7");
    }

    #[test]
    fn test_digit_suffix() {
        assert_eq!(digit_suffix("org-repo-master-42"), "42");
        assert_eq!(digit_suffix("abc"), "");
        assert_eq!(digit_suffix("123"), "123");
        assert_eq!(digit_suffix(""), "");
    }

    #[test]
    fn test_is_newer_build() {
        assert!(is_newer_build("3", "1"));
        assert!(!is_newer_build("1", "3"));
        assert!(!is_newer_build("2", "2"));
        assert!(!is_newer_build("abc", "1"));
        assert!(is_newer_build("1", "abc"));
        assert!(!is_newer_build("abc", "xyz"));
        assert!(is_newer_build("10", "9"));
    }
}
