//! Property-based tests for expected-output matching
//!
//! The transaction engine depends on `find_earliest` picking the match
//! that starts first and breaking ties by list order.

use fwpilot::session::strip_ansi;
use fwpilot::transaction::{find_earliest, normalize, MatchMode, Pattern};
use proptest::prelude::*;

const PROMPT: &str = "[root@node ~]#";

fn needle() -> impl Strategy<Value = String> {
    "[a-e]{1,3}"
}

proptest! {
    #[test]
    fn test_earliest_start_wins(
        haystack in "[a-e ]{0,200}",
        needles in prop::collection::vec(needle(), 1..6),
    ) {
        let patterns: Vec<Pattern> = needles.iter().map(|n| Pattern::exact(n.as_str())).collect();
        let starts: Vec<Option<usize>> = needles.iter().map(|n| haystack.find(n.as_str())).collect();

        match find_earliest(&patterns, &haystack, None) {
            None => prop_assert!(starts.iter().all(Option::is_none)),
            Some(found) => {
                let best = starts.iter().flatten().min().copied();
                prop_assert_eq!(Some(found.range.start), best);
                // Lowest index among the patterns starting there
                let first = starts.iter().position(|s| *s == best);
                prop_assert_eq!(Some(found.index), first);
                prop_assert_eq!(&haystack[found.range.clone()], needles[found.index].as_str());
            }
        }
    }

    #[test]
    fn test_duplicate_patterns_resolve_to_first(
        prefix in "[a-z ]{0,50}",
        needle in "[A-Z]{2,8}",
        copies in 2usize..5,
    ) {
        let haystack = format!("{}{}", prefix, needle);
        let patterns: Vec<Pattern> = (0..copies).map(|_| Pattern::exact(needle.as_str())).collect();
        let found = find_earliest(&patterns, &haystack, None).unwrap();
        prop_assert_eq!(found.index, 0);
        prop_assert_eq!(found.range.start, prefix.len());
    }

    #[test]
    fn test_exact_mode_is_literal(text in "[a-z]{1,5}[.*+?()|\\[\\]]{1,3}[a-z]{0,5}") {
        let pattern = Pattern::parse(&text, MatchMode::Exact).unwrap();
        let haystack = format!("xx {} yy", text);
        let range = pattern.find(&haystack, None).unwrap();
        prop_assert_eq!(&haystack[range], text.as_str());
    }

    #[test]
    fn test_prompt_pattern_needs_learned_prompt(body in "[a-z0-9 \\r\\n]{0,100}") {
        let haystack = format!("{}\r\n{} ", body, PROMPT);
        prop_assert!(Pattern::Prompt.find(&haystack, None).is_none());
        let range = Pattern::Prompt.find(&haystack, Some(PROMPT)).unwrap();
        prop_assert_eq!(&haystack[range], PROMPT);
    }

    #[test]
    fn test_normalize_removes_prompt(body in "[a-z0-9 .:]{0,80}") {
        let raw = format!("{} \r\n{}\r\n{} ", PROMPT, body, PROMPT);
        let output = normalize(&raw, Some(PROMPT));
        prop_assert!(!output.contains(PROMPT));
        prop_assert_eq!(output, body.trim().to_string());
    }

    #[test]
    fn test_strip_ansi_keeps_text(text in "[a-zA-Z0-9 .]{0,60}", color in 30u8..38) {
        let colored = format!("\x1b[{}m{}\x1b[0m", color, text);
        prop_assert_eq!(strip_ansi(&colored), text);
    }

    #[test]
    fn test_regex_and_exact_agree_on_plain_text(
        haystack in "[a-z ]{0,100}",
        needle in "[a-z]{1,4}",
    ) {
        let exact = Pattern::parse(&needle, MatchMode::Exact).unwrap();
        let regex = Pattern::parse(&needle, MatchMode::Regex).unwrap();
        prop_assert_eq!(exact.find(&haystack, None), regex.find(&haystack, None));
    }
}
