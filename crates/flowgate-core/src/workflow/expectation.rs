//! Quality gate: does a step's output satisfy its declared expectation?
//!
//! Any one of three routes is enough:
//!
//! 1. the output produced at least one file artifact;
//! 2. the expectation appears verbatim (case-insensitive);
//! 3. every significant expectation word matches an output word after
//!    suffix normalization ("VERIFIED" ~ "verification", "APPROVED" ~
//!    "approval").
//!
//! Empty output and placeholder-only output ("TODO: implement") never pass
//! routes 2 and 3.

use std::collections::HashSet;

use crate::workflow::artifacts::Artifact;

/// Longest suffixes first; one rule is applied per word.
const SUFFIX_RULES: &[&str] = &[
    "ications", "ication", "ations", "ation", "ions", "ion", "ied", "ies", "ing", "ed", "es",
    "s", "y",
];

const MIN_PREFIX_STEM: usize = 4;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "with", "that", "this", "from", "has", "have", "all",
];

const PLACEHOLDER_MARKERS: &[&str] = &[
    "todo",
    "tbd",
    "fixme",
    "placeholder",
    "not implemented",
    "lorem ipsum",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRoute {
    Artifact,
    Substring,
    Morphology,
    /// The step declared no expectation and produced usable output.
    NoExpectation,
}

impl MatchRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Artifact => "artifact",
            Self::Substring => "substring",
            Self::Morphology => "morphology",
            Self::NoExpectation => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExpectationMatcher;

impl ExpectationMatcher {
    pub fn new() -> Self {
        Self
    }

    pub fn matches(&self, output: &str, expectation: &str, artifacts: &[Artifact]) -> bool {
        self.evaluate(output, Some(expectation), artifacts).is_some()
    }

    /// Returns the route that satisfied the expectation, or `None`.
    pub fn evaluate(
        &self,
        output: &str,
        expectation: Option<&str>,
        artifacts: &[Artifact],
    ) -> Option<MatchRoute> {
        if !artifacts.is_empty() {
            return Some(MatchRoute::Artifact);
        }
        if is_incomplete(output) {
            return None;
        }

        let expectation = match expectation.map(str::trim) {
            None | Some("") => return Some(MatchRoute::NoExpectation),
            Some(expectation) => expectation,
        };

        if output.to_lowercase().contains(&expectation.to_lowercase()) {
            return Some(MatchRoute::Substring);
        }

        let wanted = significant_words(expectation);
        if wanted.is_empty() {
            return None;
        }
        let output_stems: HashSet<String> = words(output).map(|w| stem(&w)).collect();
        let all_found = wanted.iter().all(|word| {
            let wanted_stem = stem(word);
            output_stems
                .iter()
                .any(|candidate| stems_match(&wanted_stem, candidate))
        });
        all_found.then_some(MatchRoute::Morphology)
    }
}

/// Empty output, or output that is only placeholder markers.
pub fn is_incomplete(output: &str) -> bool {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lower = trimmed.to_lowercase();
    if PLACEHOLDER_MARKERS
        .iter()
        .any(|marker| lower.starts_with(marker))
    {
        return true;
    }
    // Every non-empty line is a placeholder marker.
    lower
        .lines()
        .map(|line| line.trim().trim_start_matches(['-', '*', '#', '/']).trim())
        .filter(|line| !line.is_empty())
        .all(|line| PLACEHOLDER_MARKERS.iter().any(|m| line.starts_with(m)))
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

fn significant_words(text: &str) -> Vec<String> {
    words(text)
        .filter(|w| w.chars().count() >= 3 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Strip the first matching suffix, keeping at least three characters.
pub fn stem(word: &str) -> String {
    let lower = word.to_lowercase();
    for suffix in SUFFIX_RULES {
        if let Some(root) = lower.strip_suffix(suffix) {
            if root.chars().count() >= 3 {
                return root.to_string();
            }
        }
    }
    lower
}

fn stems_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short.chars().count() >= MIN_PREFIX_STEM && long.starts_with(short)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact() -> Artifact {
        Artifact {
            path: "src/lib.rs".to_string(),
            language: Some("rust".to_string()),
            content: "pub fn done() {}".to_string(),
        }
    }

    #[test]
    fn test_inflected_forms_satisfy_keyword() {
        let m = ExpectationMatcher::new();
        assert!(m.matches("... verification complete ...", "VERIFIED", &[]));
        assert!(m.matches("I am verifying the result now", "VERIFIED", &[]));
        assert!(m.matches("Final approval given", "APPROVED", &[]));
        assert!(m.matches("All tests are passing", "TESTS PASSED", &[]));
        assert!(m.matches("The module was implemented", "IMPLEMENTATION", &[]));
    }

    #[test]
    fn test_placeholder_output_is_rejected() {
        let m = ExpectationMatcher::new();
        assert!(!m.matches("TODO: implement", "APPROVED", &[]));
        assert!(!m.matches("- TODO\n- TBD", "TODO", &[]));
        assert!(!m.matches("   \n", "anything", &[]));
        assert!(!m.matches("placeholder approved", "APPROVED", &[]));
    }

    #[test]
    fn test_exact_substring_case_insensitive() {
        let m = ExpectationMatcher::new();
        assert!(m.matches("Result -> status: DONE.", "STATUS: done", &[]));
        assert_eq!(
            m.evaluate("Result -> status: DONE.", Some("STATUS: done"), &[]),
            Some(MatchRoute::Substring)
        );
    }

    #[test]
    fn test_unrelated_output_fails() {
        let m = ExpectationMatcher::new();
        assert!(!m.matches("I wrote a poem about the sea", "VERIFIED", &[]));
        assert!(!m.matches("status is pending", "STATUS: done", &[]));
    }

    #[test]
    fn test_artifact_presence_satisfies_any_expectation() {
        let m = ExpectationMatcher::new();
        assert!(m.matches("Here is the file.", "STATUS: done", &[artifact()]));
        assert_eq!(
            m.evaluate("", Some("STATUS: done"), &[artifact()]),
            Some(MatchRoute::Artifact)
        );
    }

    #[test]
    fn test_missing_expectation_accepts_non_empty_output() {
        let m = ExpectationMatcher::new();
        assert_eq!(
            m.evaluate("anything useful", None, &[]),
            Some(MatchRoute::NoExpectation)
        );
        assert_eq!(m.evaluate("", None, &[]), None);
    }

    #[test]
    fn test_stem_table() {
        assert_eq!(stem("verified"), "verif");
        assert_eq!(stem("verification"), "verif");
        assert_eq!(stem("verify"), "verif");
        assert_eq!(stem("testing"), "test");
        assert_eq!(stem("approved"), "approv");
        assert_eq!(stem("red"), "red");
    }
}
