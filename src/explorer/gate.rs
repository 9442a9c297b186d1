//! Acceptance gate for candidate terms.
//!
//! A candidate is rejected when it was already issued, is on the too-broad
//! list, is a business-entity form of an issued base term, or is a multi-word
//! term containing an issued single word. Plain substrings of issued terms
//! are not rejected.

use std::collections::HashSet;
use std::fmt;

use super::strategy::BUSINESS_SUFFIXES;

/// Terms whose result sets are too large to page through before timing out.
pub const TOO_BROAD_TERMS: &[&str] = &[
    "a", "an", "and", "the", "of", "in", "at", "to", "for", "on", "by", "or", "e", "i", "o", "s",
    "n", "w", "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "street", "st", "road", "rd",
    "avenue", "ave", "llc", "inc", "co", "unit", "apt",
];

/// Why a candidate was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    AlreadyIssued,
    TooBroad,
    /// `"<base> LLC"` where `base` was already issued.
    EntitySuperset { base: String },
    /// A multi-word term containing an already-issued word.
    MultiWordSuperset { word: String },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyIssued => write!(f, "already issued"),
            Self::TooBroad => write!(f, "too broad"),
            Self::EntitySuperset { base } => write!(f, "entity form of issued term {:?}", base),
            Self::MultiWordSuperset { word } => write!(f, "contains issued word {:?}", word),
        }
    }
}

/// Terms issued so far.
///
/// Exact matches are case-sensitive; the superset rules compare
/// case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct IssuedSet {
    exact: HashSet<String>,
    folded: HashSet<String>,
}

impl IssuedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, term: &str) -> bool {
        self.folded.insert(fold(term));
        self.exact.insert(term.to_string())
    }

    pub fn contains(&self, term: &str) -> bool {
        self.exact.contains(term)
    }

    /// Forget an issued term. The folded form stays while another issued
    /// term still folds to it.
    pub fn remove(&mut self, term: &str) -> bool {
        if !self.exact.remove(term) {
            return false;
        }
        let folded = fold(term);
        if !self.exact.iter().any(|t| fold(t) == folded) {
            self.folded.remove(&folded);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    fn contains_folded(&self, term: &str) -> bool {
        self.folded.contains(&fold(term))
    }

    /// Check `term` against the gate rules.
    pub fn check(&self, term: &str) -> Result<(), Rejection> {
        if self.contains(term) {
            return Err(Rejection::AlreadyIssued);
        }

        let folded = fold(term);
        if TOO_BROAD_TERMS.contains(&folded.as_str()) {
            return Err(Rejection::TooBroad);
        }

        let words: Vec<&str> = term.split_whitespace().collect();
        if words.len() < 2 {
            return Ok(());
        }

        if let Some((last, rest)) = words.split_last() {
            if is_business_suffix(last) {
                let base = rest.join(" ");
                if self.contains_folded(&base) {
                    return Err(Rejection::EntitySuperset { base });
                }
            }
        }

        if let Some(word) = words.iter().find(|w| self.contains_folded(w)) {
            return Err(Rejection::MultiWordSuperset {
                word: (*word).to_string(),
            });
        }
        Ok(())
    }

    /// Check and, when accepted, mark the term issued.
    pub fn admit(&mut self, term: &str) -> Result<(), Rejection> {
        self.check(term)?;
        self.insert(term);
        Ok(())
    }
}

impl<S: AsRef<str>> Extend<S> for IssuedSet {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        for term in iter {
            self.insert(term.as_ref());
        }
    }
}

fn fold(term: &str) -> String {
    term.trim().to_lowercase()
}

fn is_business_suffix(word: &str) -> bool {
    let word = word.trim_end_matches('.');
    BUSINESS_SUFFIXES
        .iter()
        .any(|s| s.eq_ignore_ascii_case(word))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issued(terms: &[&str]) -> IssuedSet {
        let mut set = IssuedSet::new();
        set.extend(terms.iter());
        set
    }

    #[test]
    fn test_exact_match_rejected() {
        let set = issued(&["Smith", ""]);
        assert_eq!(set.check("Smith"), Err(Rejection::AlreadyIssued));
        assert_eq!(set.check(""), Err(Rejection::AlreadyIssued));
        assert_eq!(set.check("Jones"), Ok(()));
    }

    #[test]
    fn test_too_broad_rejected() {
        let set = IssuedSet::new();
        assert_eq!(set.check("The"), Err(Rejection::TooBroad));
        assert_eq!(set.check("LLC"), Err(Rejection::TooBroad));
        assert_eq!(set.check("Lake"), Ok(()));
    }

    #[test]
    fn test_entity_superset_rejected_but_not_reverse() {
        let set = issued(&["Smith"]);
        assert_eq!(
            set.check("Smith LLC"),
            Err(Rejection::EntitySuperset {
                base: "Smith".to_string()
            })
        );
        assert_eq!(
            set.check("smith inc."),
            Err(Rejection::EntitySuperset {
                base: "smith".to_string()
            })
        );

        // The base term is still allowed after its entity form.
        let set = issued(&["Smith LLC"]);
        assert_eq!(set.check("Smith"), Ok(()));
    }

    #[test]
    fn test_multi_word_with_issued_word_rejected() {
        let set = issued(&["Maple"]);
        assert_eq!(
            set.check("120 Maple"),
            Err(Rejection::MultiWordSuperset {
                word: "Maple".to_string()
            })
        );
        assert_eq!(set.check("120 Cedar"), Ok(()));
    }

    #[test]
    fn test_substrings_are_not_rejected() {
        let set = issued(&["Smithson"]);
        assert_eq!(set.check("Smith"), Ok(()));
        let set = issued(&["Park"]);
        assert_eq!(set.check("Parkview"), Ok(()));
    }

    #[test]
    fn test_removed_term_can_be_admitted_again() {
        let mut set = issued(&["Oak", "OAK"]);
        assert!(set.remove("Oak"));
        assert!(!set.remove("Oak"));
        assert_eq!(set.check("Oak"), Ok(()));
        // "OAK" still blocks the multi-word form.
        assert!(matches!(
            set.check("12 oak"),
            Err(Rejection::MultiWordSuperset { .. })
        ));

        assert!(set.remove("OAK"));
        assert_eq!(set.check("12 oak"), Ok(()));
    }

    #[test]
    fn test_admit_marks_term() {
        let mut set = IssuedSet::new();
        assert!(set.admit("Oak").is_ok());
        assert_eq!(set.admit("Oak"), Err(Rejection::AlreadyIssued));
        assert_eq!(set.len(), 1);
    }
}
