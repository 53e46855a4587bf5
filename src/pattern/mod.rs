//! Non-overlapping pattern search over session content.
//!
//! Patterns are evaluated in list order. A candidate match is kept only if it
//! shares no byte offset with a match already accepted for the same buffer,
//! whichever pattern produced that earlier match. All offsets are byte
//! offsets and both ends are inclusive.

pub mod kmp;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use log::warn;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use kmp::KmpSearcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternId(pub u32);

impl std::fmt::Display for PatternId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    Regex,
    /// Plain text, matched against the content's bytes as UTF-8.
    Substring,
    /// Raw bytes written as hex text, e.g. `"deadbeef"`.
    Subbytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    #[serde(default)]
    pub name: String,
    pub value: String,
    pub kind: SearchKind,
}

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("pattern {id}: invalid regex: {source}")]
    Regex {
        id: PatternId,
        #[source]
        source: regex::Error,
    },

    #[error("pattern {id}: invalid hex byte string {value:?}")]
    Hex { id: PatternId, value: String },
}

impl Pattern {
    /// Check that the pattern can be compiled / decoded.
    pub fn validate(&self) -> Result<(), PatternError> {
        match self.kind {
            SearchKind::Regex => Regex::new(&self.value)
                .map(|_| ())
                .map_err(|source| PatternError::Regex {
                    id: self.id,
                    source,
                }),
            SearchKind::Substring => Ok(()),
            SearchKind::Subbytes => self.needle_bytes().map(|_| ()),
        }
    }

    fn needle_bytes(&self) -> Result<Vec<u8>, PatternError> {
        decode_hex(&self.value).ok_or_else(|| PatternError::Hex {
            id: self.id,
            value: self.value.clone(),
        })
    }
}

/// One accepted occurrence, ordered so that a session's matches sort by
/// pattern then position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PatternMatch {
    pub pattern_id: PatternId,
    pub start: usize,
    pub end: usize,
}

impl PatternMatch {
    fn overlaps(&self, other: &PatternMatch) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Pattern search with a compiled-regex cache keyed by pattern text.
///
/// Cloning is cheap and clones share the cache, so finalization can be
/// spread over threads.
#[derive(Clone, Default)]
pub struct PatternMatcher {
    regexes: Arc<RwLock<HashMap<String, Regex>>>,
}

impl PatternMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find all non-overlapping matches of `patterns` in `content`.
    pub fn find_matches(&self, content: &[u8], patterns: &[Pattern]) -> BTreeSet<PatternMatch> {
        let mut accepted = Accepted::default();

        for pattern in patterns {
            let outcome = match pattern.kind {
                SearchKind::Regex => self.match_regex(pattern, content, &mut accepted),
                SearchKind::Substring => {
                    match_exact(pattern.id, pattern.value.as_bytes(), content, &mut accepted);
                    Ok(())
                }
                SearchKind::Subbytes => pattern.needle_bytes().map(|needle| {
                    match_exact(pattern.id, &needle, content, &mut accepted);
                }),
            };
            if let Err(e) = outcome {
                warn!("Skipping pattern: {}", e);
            }
        }

        accepted.into_matches()
    }

    fn match_regex(
        &self,
        pattern: &Pattern,
        content: &[u8],
        accepted: &mut Accepted,
    ) -> Result<(), PatternError> {
        let regex = self.compiled(pattern)?;
        for m in regex.find_iter(content) {
            if m.start() == m.end() {
                continue;
            }
            accepted.add_if_free(PatternMatch {
                pattern_id: pattern.id,
                start: m.start(),
                end: m.end() - 1,
            });
        }
        Ok(())
    }

    /// Compile once, then serve from the cache.
    fn compiled(&self, pattern: &Pattern) -> Result<Regex, PatternError> {
        if let Some(re) = self
            .regexes
            .read()
            .ok()
            .and_then(|cache| cache.get(&pattern.value).cloned())
        {
            return Ok(re);
        }

        let re = Regex::new(&pattern.value).map_err(|source| PatternError::Regex {
            id: pattern.id,
            source,
        })?;
        if let Ok(mut cache) = self.regexes.write() {
            cache
                .entry(pattern.value.clone())
                .or_insert_with(|| re.clone());
        }
        Ok(re)
    }

    #[cfg(test)]
    fn cached_regexes(&self) -> usize {
        self.regexes.read().map(|c| c.len()).unwrap_or(0)
    }
}

fn match_exact(id: PatternId, needle: &[u8], content: &[u8], accepted: &mut Accepted) {
    let mut searcher = KmpSearcher::new(needle, content);
    let len = searcher.pattern_len();
    while let Some(end) = searcher.next_match() {
        accepted.add_if_free(PatternMatch {
            pattern_id: id,
            start: end + 1 - len,
            end,
        });
    }
}

/// Matches accepted for one buffer, keyed by start offset.
///
/// Accepted ranges are disjoint, so ordering by start also orders them by
/// end. The only range that can overlap a candidate is therefore the last
/// one starting at or before the candidate's end.
#[derive(Default)]
struct Accepted {
    by_start: BTreeMap<usize, PatternMatch>,
}

impl Accepted {
    fn add_if_free(&mut self, found: PatternMatch) {
        let blocked = self
            .by_start
            .range(..=found.end)
            .next_back()
            .is_some_and(|(_, m)| m.overlaps(&found));
        if !blocked {
            self.by_start.insert(found.start, found);
        }
    }

    fn into_matches(self) -> BTreeSet<PatternMatch> {
        self.by_start.into_values().collect()
    }
}

pub(crate) fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let s: String = s.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pat(id: u32, kind: SearchKind, value: &str) -> Pattern {
        Pattern {
            id: PatternId(id),
            name: format!("p{}", id),
            value: value.to_string(),
            kind,
        }
    }

    fn m(id: u32, start: usize, end: usize) -> PatternMatch {
        PatternMatch {
            pattern_id: PatternId(id),
            start,
            end,
        }
    }

    #[test]
    fn earlier_pattern_wins_overlap() {
        let patterns = vec![
            pat(1, SearchKind::Substring, "aa"),
            pat(2, SearchKind::Substring, "aaX"),
        ];
        let found = PatternMatcher::new().find_matches(b"aaXaaYaa", &patterns);
        let expected: BTreeSet<_> = [m(1, 0, 1), m(1, 3, 4), m(1, 6, 7)].into_iter().collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn accepted_matches_never_share_offsets() {
        let patterns = vec![
            pat(1, SearchKind::Substring, "aa"),
            pat(2, SearchKind::Regex, "a+Y"),
            pat(3, SearchKind::Subbytes, "5961"),
            pat(4, SearchKind::Regex, "X"),
        ];
        let found: Vec<_> = PatternMatcher::new()
            .find_matches(b"aaXaaYaaaa", &patterns)
            .into_iter()
            .collect();
        for (i, a) in found.iter().enumerate() {
            for b in &found[i + 1..] {
                assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
            }
        }
        assert!(found.contains(&m(4, 2, 2)));
    }

    #[test]
    fn containing_candidate_is_rejected() {
        // A later candidate that fully contains an accepted match overlaps it.
        let patterns = vec![
            pat(1, SearchKind::Substring, "b"),
            pat(2, SearchKind::Substring, "abc"),
        ];
        let found = PatternMatcher::new().find_matches(b"abc", &patterns);
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![m(1, 1, 1)]);
    }

    #[test]
    fn dense_buffer_accepts_every_disjoint_match() {
        let content = vec![b'a'; 65_535];
        let patterns = vec![
            pat(1, SearchKind::Substring, "a"),
            pat(2, SearchKind::Regex, "a"),
            pat(3, SearchKind::Subbytes, "6161"),
        ];
        let found = PatternMatcher::new().find_matches(&content, &patterns);
        assert_eq!(found.len(), 65_535);
        assert!(found.iter().all(|m| m.pattern_id == PatternId(1) && m.start == m.end));
        assert_eq!(found.last(), Some(&m(1, 65_534, 65_534)));
    }

    #[test]
    fn later_candidate_between_accepted_matches() {
        let patterns = vec![
            pat(1, SearchKind::Substring, "x"),
            pat(2, SearchKind::Substring, "yy"),
            pat(3, SearchKind::Substring, "x-yy"),
        ];
        let found: Vec<_> = PatternMatcher::new()
            .find_matches(b"x-yy-x", &patterns)
            .into_iter()
            .collect();
        assert_eq!(found, vec![m(1, 0, 0), m(1, 5, 5), m(2, 2, 3)]);
    }

    #[test]
    fn empty_pattern_list_yields_nothing() {
        assert!(PatternMatcher::new().find_matches(b"anything", &[]).is_empty());
    }

    #[test]
    fn no_occurrence_yields_nothing() {
        let patterns = vec![
            pat(1, SearchKind::Substring, "flag{"),
            pat(2, SearchKind::Regex, "[0-9]{5}"),
            pat(3, SearchKind::Subbytes, "00ff"),
        ];
        assert!(PatternMatcher::new().find_matches(b"hello world", &patterns).is_empty());
    }

    #[test]
    fn regex_matches_continue_after_previous_end() {
        let patterns = vec![pat(7, SearchKind::Regex, "[A-Z0-9]{31}=")];
        let content = format!("flag {}= and {}=", "A".repeat(31), "B".repeat(31));
        let found: Vec<_> = PatternMatcher::new()
            .find_matches(content.as_bytes(), &patterns)
            .into_iter()
            .collect();
        assert_eq!(found, vec![m(7, 5, 36), m(7, 42, 73)]);
    }

    #[test]
    fn regex_empty_matches_are_ignored() {
        let patterns = vec![pat(1, SearchKind::Regex, "x*")];
        let found = PatternMatcher::new().find_matches(b"abxxc", &patterns);
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![m(1, 2, 3)]);
    }

    #[test]
    fn regex_runs_over_non_utf8_content() {
        let patterns = vec![pat(1, SearchKind::Regex, "GET")];
        let found = PatternMatcher::new().find_matches(b"\xff\xfeGET /", &patterns);
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![m(1, 2, 4)]);
    }

    #[test]
    fn subbytes_matches_raw_bytes() {
        let patterns = vec![pat(9, SearchKind::Subbytes, "DE ad be ef")];
        let found = PatternMatcher::new().find_matches(&[0x00, 0xde, 0xad, 0xbe, 0xef, 0x01], &patterns);
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![m(9, 1, 4)]);
    }

    #[test]
    fn substring_offsets_are_bytes() {
        let patterns = vec![pat(1, SearchKind::Substring, "für")];
        let found = PatternMatcher::new().find_matches("grün für".as_bytes(), &patterns);
        // "grün " is six bytes, "für" is four
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![m(1, 6, 9)]);
    }

    #[test]
    fn duplicate_patterns_collapse() {
        let patterns = vec![
            pat(1, SearchKind::Substring, "ab"),
            pat(1, SearchKind::Substring, "ab"),
        ];
        let found = PatternMatcher::new().find_matches(b"ab", &patterns);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn invalid_patterns_are_skipped() {
        let patterns = vec![
            pat(1, SearchKind::Regex, "(unclosed"),
            pat(2, SearchKind::Subbytes, "abc"),
            pat(3, SearchKind::Substring, "ok"),
        ];
        let found = PatternMatcher::new().find_matches(b"ok", &patterns);
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![m(3, 0, 1)]);
    }

    #[test]
    fn validate_reports_bad_patterns() {
        assert!(pat(1, SearchKind::Regex, "(").validate().is_err());
        assert!(pat(2, SearchKind::Subbytes, "zz").validate().is_err());
        assert!(pat(3, SearchKind::Subbytes, "0a0b").validate().is_ok());
        assert!(pat(4, SearchKind::Substring, "(").validate().is_ok());
        let err = pat(5, SearchKind::Subbytes, "f").validate().unwrap_err();
        assert!(err.to_string().contains("#5"));
    }

    #[test]
    fn regex_cache_compiles_once_per_text() {
        let matcher = PatternMatcher::new();
        let patterns = vec![pat(1, SearchKind::Regex, "a"), pat(2, SearchKind::Regex, "a")];
        matcher.find_matches(b"a", &patterns);
        matcher.find_matches(b"aa", &patterns);
        assert_eq!(matcher.cached_regexes(), 1);

        // clones share the cache
        let clone = matcher.clone();
        clone.find_matches(b"b", &[pat(3, SearchKind::Regex, "b")]);
        assert_eq!(matcher.cached_regexes(), 2);
    }
}
