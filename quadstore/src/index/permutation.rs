//! Index permutations: the field order of one B-tree's keys.

use crate::storage::btree::{Key, make_key, prefix_lower_bound, prefix_upper_bound, split_key};
use crate::storage::MAX_INDEXES;
use crate::types::{Field, Quad, QuadPattern};

/// Permutations used when none are configured.
pub const DEFAULT_PERMUTATIONS: &str = "spoc,posc";

/// One key order, e.g. `posc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Permutation {
    fields: [Field; 4],
}

impl Permutation {
    /// Parse four distinct field letters.
    pub fn parse(text: &str) -> Result<Self, PermutationError> {
        let letters: Vec<char> = text.trim().chars().collect();
        if letters.len() != 4 {
            return Err(PermutationError::WrongLength(text.to_string()));
        }
        let mut fields = [Field::Subject; 4];
        for (slot, &letter) in fields.iter_mut().zip(&letters) {
            *slot = Field::from_letter(letter.to_ascii_lowercase())
                .ok_or_else(|| PermutationError::UnknownField(letter))?;
        }
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].contains(field) {
                return Err(PermutationError::DuplicateField(text.to_string()));
            }
        }
        Ok(Self { fields })
    }

    /// Parse the name stored in a superblock.
    pub fn from_name(name: [u8; 4]) -> Result<Self, PermutationError> {
        let text: String = name.iter().map(|&b| char::from(b)).collect();
        Self::parse(&text)
    }

    #[must_use]
    pub fn name(&self) -> [u8; 4] {
        let mut name = [0u8; 4];
        for (byte, field) in name.iter_mut().zip(self.fields) {
            *byte = field.letter() as u8;
        }
        name
    }

    #[must_use]
    pub const fn fields(&self) -> [Field; 4] {
        self.fields
    }

    /// The key of `quad` in this order.
    #[must_use]
    pub fn key(&self, quad: &Quad) -> Key {
        let mut ids = [0u64; 4];
        for (id, field) in ids.iter_mut().zip(self.fields) {
            *id = quad.get(field).0;
        }
        make_key(ids)
    }

    /// The quad encoded by a key of this order.
    #[must_use]
    pub fn quad(&self, key: &Key) -> Quad {
        let ids = split_key(key);
        let mut canonical = [0u64; 4];
        for (id, field) in ids.into_iter().zip(self.fields) {
            canonical[field.index()] = id;
        }
        Quad::from_ids(canonical)
    }

    /// Bound ids of `pattern` leading this order, up to the first unbound field.
    #[must_use]
    pub fn bound_prefix(&self, pattern: &QuadPattern) -> Vec<u64> {
        self.fields
            .iter()
            .map_while(|&field| pattern.get(field).map(|id| id.0))
            .collect()
    }

    /// Inclusive key range holding every quad that matches the bound prefix.
    #[must_use]
    pub fn bounds(&self, pattern: &QuadPattern) -> (Key, Key) {
        let prefix = self.bound_prefix(pattern);
        (prefix_lower_bound(&prefix), prefix_upper_bound(&prefix))
    }
}

impl std::fmt::Display for Permutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for field in self.fields {
            write!(f, "{}", field.letter())?;
        }
        Ok(())
    }
}

/// Parse a comma separated list such as `"spoc,posc"`.
pub fn parse_permutations(list: &str) -> Result<Vec<Permutation>, PermutationError> {
    let mut permutations = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let permutation = Permutation::parse(part)?;
        if permutations.contains(&permutation) {
            return Err(PermutationError::DuplicateIndex(part.to_string()));
        }
        permutations.push(permutation);
    }
    if permutations.is_empty() {
        return Err(PermutationError::Empty);
    }
    if permutations.len() > MAX_INDEXES {
        return Err(PermutationError::TooMany(permutations.len()));
    }
    Ok(permutations)
}

/// Position in `permutations` of the best index for `pattern`: the longest
/// run of bound leading fields, earliest on ties.
#[must_use]
pub fn best_index(permutations: &[Permutation], pattern: &QuadPattern) -> usize {
    let mut best = 0;
    let mut best_len = 0;
    for (i, permutation) in permutations.iter().enumerate() {
        let len = permutation.bound_prefix(pattern).len();
        if len > best_len {
            best = i;
            best_len = len;
        }
    }
    best
}

/// Errors in an index permutation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermutationError {
    WrongLength(String),
    UnknownField(char),
    DuplicateField(String),
    DuplicateIndex(String),
    Empty,
    TooMany(usize),
}

impl std::fmt::Display for PermutationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WrongLength(name) => write!(f, "index '{name}' must name four fields"),
            Self::UnknownField(c) => write!(f, "unknown index field '{c}' (expected s, p, o or c)"),
            Self::DuplicateField(name) => write!(f, "index '{name}' repeats a field"),
            Self::DuplicateIndex(name) => write!(f, "index '{name}' listed twice"),
            Self::Empty => write!(f, "at least one index is required"),
            Self::TooMany(n) => write!(f, "{n} indexes configured, at most {MAX_INDEXES} allowed"),
        }
    }
}

impl std::error::Error for PermutationError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TermId;

    fn pattern(s: Option<u64>, p: Option<u64>, o: Option<u64>, c: Option<u64>) -> QuadPattern {
        QuadPattern {
            subject: s.map(TermId),
            predicate: p.map(TermId),
            object: o.map(TermId),
            context: c.map(TermId),
        }
    }

    #[test]
    fn test_key_order_follows_fields() {
        let posc = Permutation::parse("posc").expect("parse");
        let quad = Quad::from_ids([1, 2, 3, 4]);
        assert_eq!(split_key(&posc.key(&quad)), [2, 3, 1, 4]);
        assert_eq!(posc.quad(&posc.key(&quad)), quad);
        assert_eq!(&posc.name(), b"posc");
        assert_eq!(posc.to_string(), "posc");
    }

    #[test]
    fn test_parse_list() {
        let perms = parse_permutations(DEFAULT_PERMUTATIONS).expect("default");
        assert_eq!(perms.len(), 2);
        assert_eq!(
            parse_permutations(" spoc , CSPO ").expect("spaces and case")[1].to_string(),
            "cspo"
        );
    }

    #[test]
    fn test_invalid_specs() {
        assert_eq!(parse_permutations(""), Err(PermutationError::Empty));
        assert!(matches!(
            parse_permutations("spo"),
            Err(PermutationError::WrongLength(_))
        ));
        assert!(matches!(
            parse_permutations("spox"),
            Err(PermutationError::UnknownField('x'))
        ));
        assert!(matches!(
            parse_permutations("sppc"),
            Err(PermutationError::DuplicateField(_))
        ));
        assert!(matches!(
            parse_permutations("spoc,spoc"),
            Err(PermutationError::DuplicateIndex(_))
        ));
        assert!(matches!(
            parse_permutations("spoc,posc,ospc,cspo,pocs"),
            Err(PermutationError::TooMany(5))
        ));
    }

    #[test]
    fn test_best_index_prefers_longest_bound_prefix() {
        let perms = parse_permutations("spoc,posc,ospc").expect("parse");
        assert_eq!(best_index(&perms, &pattern(Some(1), None, None, None)), 0);
        assert_eq!(best_index(&perms, &pattern(None, Some(2), None, None)), 1);
        assert_eq!(best_index(&perms, &pattern(None, Some(2), Some(3), None)), 1);
        assert_eq!(best_index(&perms, &pattern(Some(1), None, Some(3), None)), 2);
        // Nothing leads with context: registry order wins.
        assert_eq!(best_index(&perms, &pattern(None, None, None, Some(4))), 0);
        assert_eq!(best_index(&perms, &QuadPattern::default()), 0);
    }

    #[test]
    fn test_bounds_cover_prefix() {
        let spoc = Permutation::parse("spoc").expect("parse");
        let (lower, upper) = spoc.bounds(&pattern(Some(7), Some(8), None, Some(9)));
        assert_eq!(split_key(&lower), [7, 8, 0, 0]);
        assert_eq!(split_key(&upper), [7, 8, u64::MAX, u64::MAX]);
    }
}
