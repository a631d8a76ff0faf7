//! Static reference data used for sanity-checking and disambiguation:
//! known sets, rarity text patterns, copyright-era regexes, and the
//! collector-number format. Keep this minimal & composable; it can move to
//! config/JSON later.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // "018/195", "TG12/TG30", "SV045 / 198": numerator then printed total
    static ref COLLECTOR_NUMBER_RE: Regex =
        Regex::new(r"(?i)\b([a-z]{0,4}\d{1,3})\s*/\s*([a-z]{0,4}\d{1,3})\b").unwrap();

    // "©2022 Pokémon", "(c) 1995-2001 Nintendo"
    static ref COPYRIGHT_RE: Regex =
        Regex::new(r"(?i)(?:©|\(c\))\s*(?:[a-z.\s]*)?(\d{4})(?:\s*[-–]\s*(\d{4}))?").unwrap();

    // "Illus. Mitsuhiro Arita"
    static ref ILLUSTRATOR_RE: Regex =
        Regex::new(r"(?i)illus\.?\s+([a-z][a-z.\-' ]+[a-z.])").unwrap();
}

/// Rarity keyword patterns, checked in order; first hit wins so the more
/// specific entries come first.
const RARITY_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)\bsecret\s+rare\b", "Secret Rare"),
    (r"(?i)\brainbow\s+rare\b", "Rainbow Rare"),
    (r"(?i)\bhyper\s+rare\b", "Hyper Rare"),
    (r"(?i)\bultra\s+rare\b", "Ultra Rare"),
    (r"(?i)\billustration\s+rare\b", "Illustration Rare"),
    (r"(?i)\breverse\s+holo", "Reverse Holo"),
    (r"(?i)\bholo(?:graphic)?\s+rare\b", "Holo Rare"),
    (r"(?i)\bamazing\s+rare\b", "Amazing Rare"),
    (r"(?i)\bpromo\b", "Promo"),
    (r"(?i)\brare\b", "Rare"),
    (r"(?i)\buncommon\b", "Uncommon"),
    (r"(?i)\bcommon\b", "Common"),
];

/// Name suffixes that imply a premium (treated-finish) printing even when no
/// rarity word is printed on the card.
const PREMIUM_NAME_SUFFIXES: &[&str] = &["vmax", "vstar", "v-union", " ex", " gx", " v"];

#[derive(Clone, Debug)]
pub struct KnownSet {
    pub name: String,
    pub release_year: i32,
}

/// Static reference data for disambiguation heuristics. Not a catalog;
/// the external catalog service stays authoritative. This is the local
/// sanity-check layer that works offline.
pub struct KnowledgeBase {
    known_sets: Vec<KnownSet>,
    rarity_patterns: Vec<(Regex, &'static str)>,
}

impl Default for KnowledgeBase {
    fn default() -> Self {
        let known_sets = [
            ("Base Set", 1999),
            ("Jungle", 1999),
            ("Fossil", 1999),
            ("Team Rocket", 2000),
            ("Neo Genesis", 2000),
            ("Expedition Base Set", 2002),
            ("EX Ruby & Sapphire", 2003),
            ("Diamond & Pearl", 2007),
            ("HeartGold & SoulSilver", 2010),
            ("Black & White", 2011),
            ("XY", 2014),
            ("Evolutions", 2016),
            ("Sun & Moon", 2017),
            ("Hidden Fates", 2019),
            ("Sword & Shield", 2020),
            ("Darkness Ablaze", 2020),
            ("Vivid Voltage", 2020),
            ("Evolving Skies", 2021),
            ("Celebrations", 2021),
            ("Brilliant Stars", 2022),
            ("Astral Radiance", 2022),
            ("Lost Origin", 2022),
            ("Silver Tempest", 2022),
            ("Crown Zenith", 2023),
            ("Scarlet & Violet", 2023),
            ("Obsidian Flames", 2023),
            ("Paradox Rift", 2023),
            ("Temporal Forces", 2024),
        ]
        .into_iter()
        .map(|(name, release_year)| KnownSet {
            name: name.to_string(),
            release_year,
        })
        .collect();

        let rarity_patterns = RARITY_PATTERNS
            .iter()
            .map(|(pat, label)| (Regex::new(pat).unwrap(), *label))
            .collect();

        Self {
            known_sets,
            rarity_patterns,
        }
    }
}

impl KnowledgeBase {
    pub fn known_set_names(&self) -> impl Iterator<Item = &str> {
        self.known_sets.iter().map(|s| s.name.as_str())
    }

    pub fn set_release_year(&self, set_name: &str) -> Option<i32> {
        let target = crate::matching::fuzzy::normalize_name(set_name);
        self.known_sets
            .iter()
            .find(|s| crate::matching::fuzzy::normalize_name(&s.name) == target)
            .map(|s| s.release_year)
    }

    /// First collector number found in free text: (numerator, printed total).
    pub fn find_collector_number(text: &str) -> Option<(String, String)> {
        COLLECTOR_NUMBER_RE
            .captures(text)
            .map(|c| (c[1].to_string(), c[2].to_string()))
    }

    /// Copyright years from a bottom-of-card run: (first, optional last).
    pub fn copyright_years(text: &str) -> Option<(i32, Option<i32>)> {
        COPYRIGHT_RE.captures(text).and_then(|c| {
            let first = c[1].parse().ok()?;
            let last = c.get(2).and_then(|m| m.as_str().parse().ok());
            Some((first, last))
        })
    }

    /// Illustrator credit ("Illus. Name") if printed in the text.
    pub fn find_illustrator(text: &str) -> Option<String> {
        ILLUSTRATOR_RE
            .captures(text)
            .map(|c| c[1].trim().to_string())
    }

    /// Canonical rarity label from printed rarity text, if recognized.
    pub fn rarity_from_text(&self, text: &str) -> Option<&'static str> {
        self.rarity_patterns
            .iter()
            .find(|(re, _)| re.is_match(text))
            .map(|(_, label)| *label)
    }

    /// Whether a card with this rarity/name is expected to carry a treated
    /// (holographic) finish. Price adapters use this to pick the variant.
    pub fn treated_finish(rarity: Option<&str>, card_name: &str) -> bool {
        if let Some(r) = rarity {
            let r = r.to_lowercase();
            if r.contains("holo")
                || r.contains("secret")
                || r.contains("ultra")
                || r.contains("rainbow")
                || r.contains("hyper")
                || r.contains("illustration")
                || r.contains("amazing")
            {
                return true;
            }
        }
        let name = card_name.to_lowercase();
        PREMIUM_NAME_SUFFIXES
            .iter()
            .any(|suffix| name.ends_with(suffix) || name.contains(&format!("{suffix} ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_number_variants() {
        assert_eq!(
            KnowledgeBase::find_collector_number("018/195"),
            Some(("018".to_string(), "195".to_string()))
        );
        assert_eq!(
            KnowledgeBase::find_collector_number("card TG12 / TG30 bottom row"),
            Some(("TG12".to_string(), "TG30".to_string()))
        );
        assert_eq!(KnowledgeBase::find_collector_number("no number here"), None);
    }

    #[test]
    fn copyright_year_runs() {
        assert_eq!(
            KnowledgeBase::copyright_years("©2022 Pokémon"),
            Some((2022, None))
        );
        assert_eq!(
            KnowledgeBase::copyright_years("(c) 1995-2001 Nintendo"),
            Some((1995, Some(2001)))
        );
        assert_eq!(KnowledgeBase::copyright_years("Stage 2 Pokemon"), None);
    }

    #[test]
    fn rarity_patterns_prefer_specific() {
        let kb = KnowledgeBase::default();
        assert_eq!(kb.rarity_from_text("Secret Rare 201/195"), Some("Secret Rare"));
        assert_eq!(kb.rarity_from_text("reverse holo common"), Some("Reverse Holo"));
        assert_eq!(kb.rarity_from_text("a common card"), Some("Common"));
        assert_eq!(kb.rarity_from_text("nothing printed"), None);
    }

    #[test]
    fn treated_finish_heuristics() {
        assert!(KnowledgeBase::treated_finish(Some("Holo Rare"), "Charizard"));
        assert!(KnowledgeBase::treated_finish(None, "Charizard VMAX"));
        assert!(!KnowledgeBase::treated_finish(Some("Common"), "Bidoof"));
    }

    #[test]
    fn illustrator_credit() {
        assert_eq!(
            KnowledgeBase::find_illustrator("Illus. Mitsuhiro Arita"),
            Some("Mitsuhiro Arita".to_string())
        );
    }

    #[test]
    fn set_release_year_is_fuzzy_on_case() {
        let kb = KnowledgeBase::default();
        assert_eq!(kb.set_release_year("lost origin"), Some(2022));
        assert_eq!(kb.set_release_year("Unknown Set"), None);
    }
}
