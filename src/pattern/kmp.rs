/// Restartable Knuth-Morris-Pratt search over a borrowed haystack.
///
/// The searcher owns the prefix table, the read cursor into the haystack and
/// the length of the currently matched prefix, so each `next_match` call
/// resumes exactly where the previous one stopped without rescanning.
pub struct KmpSearcher<'a, T> {
    pattern: &'a [T],
    prefix: Vec<usize>,
    haystack: &'a [T],
    cursor: usize,
    matched: usize,
}

impl<'a, T: PartialEq> KmpSearcher<'a, T> {
    pub fn new(pattern: &'a [T], haystack: &'a [T]) -> Self {
        KmpSearcher {
            pattern,
            prefix: prefix_function(pattern),
            haystack,
            cursor: 0,
            matched: 0,
        }
    }

    /// Inclusive end offset of the next occurrence, or `None` once the
    /// haystack is exhausted. An empty pattern never matches.
    pub fn next_match(&mut self) -> Option<usize> {
        if self.pattern.is_empty() {
            return None;
        }

        while self.cursor < self.haystack.len() {
            let item = &self.haystack[self.cursor];
            self.cursor += 1;

            while self.matched > 0 && *item != self.pattern[self.matched] {
                self.matched = self.prefix[self.matched - 1];
            }
            if *item == self.pattern[self.matched] {
                self.matched += 1;
            }
            if self.matched == self.pattern.len() {
                self.matched = self.prefix[self.matched - 1];
                return Some(self.cursor - 1);
            }
        }

        None
    }

    pub fn pattern_len(&self) -> usize {
        self.pattern.len()
    }
}

impl<T: PartialEq> Iterator for KmpSearcher<'_, T> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        self.next_match()
    }
}

/// `prefix[i]` is the length of the longest proper prefix of
/// `pattern[..=i]` that is also its suffix.
fn prefix_function<T: PartialEq>(pattern: &[T]) -> Vec<usize> {
    let mut prefix = vec![0; pattern.len()];
    let mut k = 0;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = prefix[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        prefix[i] = k;
    }
    prefix
}
