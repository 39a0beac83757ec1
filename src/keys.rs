//! Comparison keys for tracking identifiers
//!
//! Identifiers are compared in two spaces:
//! - canonical: uppercase ASCII letters and digits only, used against text layers
//! - OCR-tolerant: canonical with visually confusable letters folded to digits,
//!   used against recognized text

use std::collections::HashSet;

/// Reduce a raw string to its canonical comparison key.
///
/// Case is folded to upper case and every character that is not an ASCII
/// letter or digit is dropped. Total and idempotent; empty input gives an
/// empty key.
pub fn canonicalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// One-directional substitution table for OCR misreads.
///
/// Each pair rewrites a letter that recognition engines commonly confuse with a
/// digit. Every extra pair widens the tolerant space, so the table is explicit
/// configuration rather than a hidden constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionTable {
    pairs: Vec<(char, char)>,
}

impl Default for ConfusionTable {
    fn default() -> Self {
        Self {
            pairs: vec![('O', '0'), ('I', '1'), ('Z', '2'), ('S', '5'), ('B', '8')],
        }
    }
}

impl ConfusionTable {
    /// A table that rewrites nothing (tolerant keys equal canonical keys)
    pub fn empty() -> Self {
        Self { pairs: Vec::new() }
    }

    /// Add or replace the substitution for `from`.
    ///
    /// Both characters are upper-cased, since the table is applied to
    /// canonical keys.
    pub fn with_substitution(mut self, from: char, to: char) -> Self {
        let from = from.to_ascii_uppercase();
        let to = to.to_ascii_uppercase();
        if let Some(pair) = self.pairs.iter_mut().find(|(f, _)| *f == from) {
            pair.1 = to;
        } else {
            self.pairs.push((from, to));
        }
        self
    }

    pub fn pairs(&self) -> &[(char, char)] {
        &self.pairs
    }

    /// Map a canonical key into the OCR-tolerant space
    pub fn apply(&self, canonical: &str) -> String {
        canonical
            .chars()
            .map(|c| {
                self.pairs
                    .iter()
                    .find(|(from, _)| *from == c)
                    .map_or(c, |(_, to)| *to)
            })
            .collect()
    }

    /// Check that no substitution chains into another (`A->B`, `B->C`).
    ///
    /// A chained table is not idempotent, so the same recognized text could
    /// land on different keys depending on how often it was mapped.
    pub fn validate(&self) -> Result<(), String> {
        for (from, to) in &self.pairs {
            if !from.is_ascii_alphanumeric() || !to.is_ascii_alphanumeric() {
                return Err(format!(
                    "confusion pair {from}->{to} must map letters or digits"
                ));
            }
            if self.pairs.iter().any(|(f, _)| f == to) {
                return Err(format!(
                    "confusion pair {from}->{to} chains into another substitution"
                ));
            }
        }
        Ok(())
    }
}

/// A tracking identifier with its precomputed keys
#[derive(Debug, Clone)]
pub struct Target {
    /// The identifier exactly as supplied by the caller
    pub identifier: String,
    pub canonical: String,
    pub tolerant: String,
}

/// Ordered set of targets for one run.
///
/// Keys are computed once here and reused for every page comparison.
#[derive(Debug, Clone)]
pub struct TargetSet {
    targets: Vec<Target>,
}

impl TargetSet {
    /// Build the set, rejecting empty lists, identifiers with no alphanumeric
    /// content and identifiers that collide after canonicalization.
    pub fn new<S: AsRef<str>>(identifiers: &[S], table: &ConfusionTable) -> Result<Self, String> {
        if identifiers.is_empty() {
            return Err("no tracking identifiers supplied".to_string());
        }

        let mut seen = HashSet::with_capacity(identifiers.len());
        let mut targets = Vec::with_capacity(identifiers.len());

        for raw in identifiers {
            let identifier = raw.as_ref();
            let canonical = canonicalize(identifier);
            if canonical.is_empty() {
                return Err(format!(
                    "identifier {identifier:?} has no letters or digits"
                ));
            }
            if !seen.insert(canonical.clone()) {
                return Err(format!(
                    "identifier {identifier:?} duplicates key {canonical}"
                ));
            }
            let tolerant = table.apply(&canonical);
            targets.push(Target {
                identifier: identifier.to_string(),
                canonical,
                tolerant,
            });
        }

        Ok(Self { targets })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Target> {
        self.targets.get(index)
    }

    /// Indices of targets whose canonical key occurs in `canonical_text`
    pub fn exact_hits(&self, canonical_text: &str) -> Vec<usize> {
        self.hits(canonical_text, |t| &t.canonical)
    }

    /// Indices of targets whose tolerant key occurs in `tolerant_text`
    pub fn tolerant_hits(&self, tolerant_text: &str) -> Vec<usize> {
        self.hits(tolerant_text, |t| &t.tolerant)
    }

    fn hits<F>(&self, haystack: &str, key: F) -> Vec<usize>
    where
        F: Fn(&Target) -> &str,
    {
        if haystack.is_empty() {
            return Vec::new();
        }

        let found: Vec<usize> = self
            .targets
            .iter()
            .enumerate()
            .filter(|(_, t)| haystack.contains(key(t)))
            .map(|(i, _)| i)
            .collect();

        if found.len() < 2 {
            return found;
        }

        // A key is a side effect of a longer found key when every one of its
        // occurrences sits inside an occurrence of that longer key.
        let shadowed = |i: usize| {
            let k = key(&self.targets[i]);
            let spans: Vec<(usize, usize)> = found
                .iter()
                .filter(|&&j| j != i)
                .map(|&j| key(&self.targets[j]))
                .filter(|other| other.len() > k.len() && other.contains(k))
                .flat_map(|other| occurrences(haystack, other).map(move |s| (s, s + other.len())))
                .collect();
            !spans.is_empty()
                && occurrences(haystack, k)
                    .all(|s| spans.iter().any(|&(a, b)| a <= s && s + k.len() <= b))
        };

        found.iter().copied().filter(|&i| !shadowed(i)).collect()
    }
}

/// Start offsets of every occurrence of `needle`, overlapping ones included
fn occurrences<'h>(haystack: &'h str, needle: &'h str) -> impl Iterator<Item = usize> + 'h {
    let mut from = 0;
    std::iter::from_fn(move || {
        let start = from + haystack.get(from..)?.find(needle)?;
        from = start + needle.chars().next().map_or(1, char::len_utf8);
        Some(start)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_separators_and_case() {
        assert_eq!(canonicalize("th-0001"), "TH0001");
        assert_eq!(canonicalize("TH0001"), "TH0001");
        assert_eq!(canonicalize("t h 0 0 0 1"), "TH0001");
        assert_eq!(canonicalize(""), "");
        assert_eq!(canonicalize("--//  "), "");
    }

    #[test]
    fn test_canonicalize_idempotent() {
        for raw in ["Kerry: KEX-12 34", "flash/ th0001 ", "ไปรษณีย์ EF123TH"] {
            let once = canonicalize(raw);
            assert_eq!(canonicalize(&once), once);
        }
    }

    #[test]
    fn test_canonicalize_drops_non_ascii() {
        assert_eq!(canonicalize("เลข TH-01"), "TH01");
    }

    #[test]
    fn test_default_confusions() {
        let table = ConfusionTable::default();
        assert_eq!(table.apply("TH00O1"), "TH0001");
        assert_eq!(table.apply("SBIZO"), "58120");
        assert_eq!(table.apply("TH0001"), "TH0001");
    }

    #[test]
    fn test_custom_substitution() {
        let table = ConfusionTable::default().with_substitution('q', '0');
        assert_eq!(table.apply("QO"), "00");
        assert!(table.validate().is_ok());

        let replaced = ConfusionTable::default().with_substitution('O', 'D');
        assert_eq!(replaced.apply("O"), "D");
    }

    #[test]
    fn test_chained_table_rejected() {
        let table = ConfusionTable::empty()
            .with_substitution('A', 'B')
            .with_substitution('B', '8');
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_target_set_rejects_bad_input() {
        let table = ConfusionTable::default();
        let empty: [&str; 0] = [];
        assert!(TargetSet::new(&empty, &table).is_err());
        assert!(TargetSet::new(&["TH01", " - "], &table).is_err());
        assert!(TargetSet::new(&["TH-01", "th01"], &table).is_err());
    }

    #[test]
    fn test_target_set_precomputes_keys() {
        let set = TargetSet::new(&["th-s01"], &ConfusionTable::default()).unwrap();
        let target = set.get(0).unwrap();
        assert_eq!(target.identifier, "th-s01");
        assert_eq!(target.canonical, "THS01");
        assert_eq!(target.tolerant, "TH501");
    }

    #[test]
    fn test_exact_and_tolerant_hits() {
        let set = TargetSet::new(&["TH0001", "TH0002"], &ConfusionTable::default()).unwrap();
        assert_eq!(set.exact_hits("SHIPTOTH0002BANGKOK"), vec![1]);
        assert!(set.exact_hits("TH00O1").is_empty());
        assert_eq!(set.tolerant_hits("TH0001"), vec![0]);
        assert!(set.exact_hits("").is_empty());
    }

    #[test]
    fn test_contained_key_yields_to_longer_key() {
        let set = TargetSet::new(&["TH0001", "TH00011"], &ConfusionTable::default()).unwrap();
        assert_eq!(set.exact_hits("XXTH00011XX"), vec![1]);
        assert_eq!(set.exact_hits("TH0001ANDTH0002"), vec![0]);
    }

    #[test]
    fn test_contained_key_kept_when_it_also_stands_alone() {
        let set = TargetSet::new(&["TH0001", "TH00011"], &ConfusionTable::default()).unwrap();
        assert_eq!(set.exact_hits("TH0001XTH00011"), vec![0, 1]);
        assert_eq!(set.exact_hits("TH00011XTH00011"), vec![1]);
        assert_eq!(set.exact_hits("TH00011TH0001"), vec![0, 1]);
    }

    #[test]
    fn test_overlapping_occurrences() {
        assert_eq!(occurrences("AAAA", "AA").collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(occurrences("XTH1", "TH1").collect::<Vec<_>>(), vec![1]);
        assert_eq!(occurrences("X", "TH1").count(), 0);
    }

    #[test]
    fn test_two_distinct_keys_on_one_page() {
        let set = TargetSet::new(&["TH0001", "TH0002"], &ConfusionTable::default()).unwrap();
        assert_eq!(set.exact_hits("TH0002TH0001"), vec![0, 1]);
    }
}
