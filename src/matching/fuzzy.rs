use deunicode::deunicode;
use regex::Regex;

/// Canonical form for card/set names before any comparison: lowercase,
/// ASCII-fold, strip punctuation, collapse whitespace.
pub fn normalize_name(raw: &str) -> String {
    lazy_static::lazy_static! {
        static ref PUNCT_RE: Regex = Regex::new(r"[^\w\s]").unwrap(); // strip any char not a word char or whitespace
    }

    let lower = raw.to_lowercase();
    let ascii = deunicode(&lower); // é -> e, ñ -> n, …
    let no_punct = PUNCT_RE.replace_all(&ascii, "");

    // collapse tabs/newlines/multiple spaces into a single space
    no_punct
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

#[derive(Clone, Debug)]
pub struct FuzzyMatch<'a> {
    pub value: &'a str,
    pub score: f64, // 0.0 to 1.0
}

/// Approximate string matcher for correcting OCR text against a dictionary
/// of known names. Edit-distance based, threshold-gated.
#[derive(Clone, Debug)]
pub struct FuzzyMatcher {
    threshold: f64,
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self { threshold: 0.75 }
    }
}

impl FuzzyMatcher {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// Normalized Levenshtein similarity over canonicalized strings.
    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        strsim::normalized_levenshtein(&normalize_name(a), &normalize_name(b))
    }

    /// Best dictionary entry above the threshold, if any.
    pub fn best_match<'a, I>(&self, query: &str, dictionary: I) -> Option<FuzzyMatch<'a>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut best: Option<FuzzyMatch<'a>> = None;
        for entry in dictionary {
            let score = self.similarity(query, entry);
            if score >= self.threshold && best.as_ref().map(|b| score > b.score).unwrap_or(true) {
                best = Some(FuzzyMatch { value: entry, score });
            }
        }
        best
    }
}
