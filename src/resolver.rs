//!
//! Console name resolver: turns an ordered list of patterns
//! into the subset of configured console names that match at least one
//! of them, via a single compiled alternation regex.
//!
//! Grounded in `original_source/server-sock.c`'s `query_consoles`: patterns
//! are joined with `|`, compiled once with `REG_EXTENDED | REG_ICASE |
//! REG_NOSUB | REG_NEWLINE`, and matched against every known console name.
//!

use regex::RegexBuilder;

use crate::error::{Error, Result};

/// Extended-regex metacharacters that need escaping when they appear
/// literally in a translated glob pattern.
const REGEX_METACHARS: &[char] = &['.', '^', '$', '+', '(', ')', '[', ']', '{', '}', '|', '\\'];

/// Translates a shell-glob pattern into an extended-regex equivalent:
/// `*` becomes `.*`, `?` becomes `.`, and every other regex metacharacter
/// is escaped so it matches itself literally.
pub fn translate_glob(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            _ => {
                if REGEX_METACHARS.contains(&c) {
                    out.push('\\');
                }
                out.push(c);
            }
        }
    }
    out
}

/// Compiles `patterns` (already translated to regex syntax by the caller
/// when glob mode is in effect) into one alternation and returns the
/// subset of `names` that match any of them.
///
/// Compilation failure yields `Error::BadRegex` with the regex engine's
/// own diagnostic.
pub fn resolve<'a>(names: &[&'a str], patterns: &[String]) -> Result<Vec<&'a str>> {
    if patterns.is_empty() {
        return Ok(Vec::new());
    }
    let joined = patterns.join("|");
    let rex = RegexBuilder::new(&joined)
        .case_insensitive(true)
        .multi_line(false)
        .dot_matches_new_line(false)
        .build()
        .map_err(|e| Error::BadRegex(e.to_string()))?;

    Ok(names.iter().copied().filter(|name| rex.is_match(name)).collect())
}

/// Convenience wrapper used by the session layer: builds the pattern list
/// according to `use_regex` (translating globs when it's false) before
/// calling `resolve`. An empty pattern list is treated as `.*`, matching
/// everything.
pub fn resolve_request<'a>(names: &[&'a str], raw_patterns: &[String], use_regex: bool) -> Result<Vec<&'a str>> {
    let patterns: Vec<String> = if raw_patterns.is_empty() {
        vec![String::from(".*")]
    } else if use_regex {
        raw_patterns.to_vec()
    } else {
        raw_patterns.iter().map(|p| translate_glob(p)).collect()
    };
    resolve(names, &patterns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_and_question_translate() {
        assert_eq!(translate_glob("node*"), "node.*");
        assert_eq!(translate_glob("node?"), "node.");
        assert_eq!(translate_glob("a.b"), r"a\.b");
    }

    #[test]
    fn resolves_matching_subset() {
        let names = ["nodeA", "nodeB", "switch1"];
        let matched = resolve_request(&names, &["node*".to_string()], false).unwrap();
        assert_eq!(matched, vec!["nodeA", "nodeB"]);
    }

    #[test]
    fn empty_pattern_list_matches_everything() {
        let names = ["a", "b"];
        let matched = resolve_request(&names, &[], false).unwrap();
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn regex_mode_passes_pattern_through() {
        let names = ["nodeA", "nodeB1", "other"];
        let matched = resolve_request(&names, &["node[AB]1?$".to_string()], true).unwrap();
        assert!(matched.contains(&"nodeB1"));
    }

    #[test]
    fn bad_regex_surfaces_engine_diagnostic() {
        let names = ["a"];
        let err = resolve_request(&names, &["(".to_string()], true).unwrap_err();
        match err {
            Error::BadRegex(msg) => assert!(!msg.is_empty()),
            _ => panic!("expected BadRegex"),
        }
    }

    #[test]
    fn resolver_is_case_insensitive() {
        let names = ["NodeA"];
        let matched = resolve_request(&names, &["nodea".to_string()], false).unwrap();
        assert_eq!(matched, vec!["NodeA"]);
    }

    #[test]
    fn property_resolver_matches_exact_set() {
        // property 6: resolver returns exactly { c in S : exists p in P, match(translate(p), c) }.
        let names = ["alpha", "beta", "gamma", "alphabet"];
        let patterns = vec!["alpha".to_string(), "gamma".to_string()];
        let matched = resolve_request(&names, &patterns, false).unwrap();
        let expected: Vec<&str> = names
            .iter()
            .copied()
            .filter(|n| {
                patterns.iter().any(|p| {
                    let translated = translate_glob(p);
                    RegexBuilder::new(&translated)
                        .case_insensitive(true)
                        .build()
                        .unwrap()
                        .is_match(n)
                })
            })
            .collect();
        assert_eq!(matched, expected);
    }
}
