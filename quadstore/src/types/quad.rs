//! Quads at the id level and statements at the term level.

use crate::types::{Term, TermId};

/// The four positions of a quad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Subject,
    Predicate,
    Object,
    Context,
}

impl Field {
    /// All fields in canonical order.
    pub const ALL: [Self; 4] = [Self::Subject, Self::Predicate, Self::Object, Self::Context];

    /// Letter used in permutation names.
    #[must_use]
    pub const fn letter(self) -> char {
        match self {
            Self::Subject => 's',
            Self::Predicate => 'p',
            Self::Object => 'o',
            Self::Context => 'c',
        }
    }

    #[must_use]
    pub const fn from_letter(letter: char) -> Option<Self> {
        match letter {
            's' => Some(Self::Subject),
            'p' => Some(Self::Predicate),
            'o' => Some(Self::Object),
            'c' => Some(Self::Context),
            _ => None,
        }
    }

    /// Position of the field in canonical (s, p, o, c) order.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Subject => 0,
            Self::Predicate => 1,
            Self::Object => 2,
            Self::Context => 3,
        }
    }
}

/// A quad of term ids. `context == TermId::DEFAULT_GRAPH` is the default graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quad {
    pub subject: TermId,
    pub predicate: TermId,
    pub object: TermId,
    pub context: TermId,
}

impl Quad {
    #[must_use]
    pub const fn new(subject: TermId, predicate: TermId, object: TermId, context: TermId) -> Self {
        Self {
            subject,
            predicate,
            object,
            context,
        }
    }

    /// Ids in canonical (s, p, o, c) order.
    #[must_use]
    pub const fn ids(&self) -> [u64; 4] {
        [
            self.subject.0,
            self.predicate.0,
            self.object.0,
            self.context.0,
        ]
    }

    /// Build a quad from ids in canonical order.
    #[must_use]
    pub const fn from_ids(ids: [u64; 4]) -> Self {
        Self {
            subject: TermId(ids[0]),
            predicate: TermId(ids[1]),
            object: TermId(ids[2]),
            context: TermId(ids[3]),
        }
    }

    #[must_use]
    pub const fn get(&self, field: Field) -> TermId {
        match field {
            Field::Subject => self.subject,
            Field::Predicate => self.predicate,
            Field::Object => self.object,
            Field::Context => self.context,
        }
    }
}

/// A quad pattern: `None` leaves a position unbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct QuadPattern {
    pub subject: Option<TermId>,
    pub predicate: Option<TermId>,
    pub object: Option<TermId>,
    pub context: Option<TermId>,
}

impl QuadPattern {
    #[must_use]
    pub const fn get(&self, field: Field) -> Option<TermId> {
        match field {
            Field::Subject => self.subject,
            Field::Predicate => self.predicate,
            Field::Object => self.object,
            Field::Context => self.context,
        }
    }

    /// True if every bound position equals the quad's.
    #[must_use]
    pub fn matches(&self, quad: &Quad) -> bool {
        Field::ALL
            .iter()
            .all(|&field| self.get(field).is_none_or(|id| id == quad.get(field)))
    }

    /// True if the two patterns can match a common quad.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        Field::ALL.iter().all(|&field| {
            match (self.get(field), other.get(field)) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        })
    }

    /// The pattern matching exactly one quad.
    #[must_use]
    pub const fn exact(quad: &Quad) -> Self {
        Self {
            subject: Some(quad.subject),
            predicate: Some(quad.predicate),
            object: Some(quad.object),
            context: Some(quad.context),
        }
    }
}

/// A statement at the term level, as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Statement {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
    /// `None` for the default graph.
    pub context: Option<Term>,
    /// False for inferred statements.
    pub explicit: bool,
}

impl std::fmt::Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.subject, self.predicate, self.object)?;
        if let Some(context) = &self.context {
            write!(f, " {context}")?;
        }
        write!(f, " .")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(s: u64, p: u64, o: u64, c: u64) -> Quad {
        Quad::from_ids([s, p, o, c])
    }

    #[test]
    fn test_pattern_matching() {
        let pattern = QuadPattern {
            subject: Some(TermId(1)),
            context: Some(TermId::DEFAULT_GRAPH),
            ..QuadPattern::default()
        };
        assert!(pattern.matches(&quad(1, 2, 3, 0)));
        assert!(!pattern.matches(&quad(1, 2, 3, 4)));
        assert!(!pattern.matches(&quad(2, 2, 3, 0)));
        assert!(QuadPattern::default().matches(&quad(9, 9, 9, 9)));
    }

    #[test]
    fn test_pattern_overlap() {
        let a = QuadPattern {
            subject: Some(TermId(1)),
            ..QuadPattern::default()
        };
        let b = QuadPattern {
            predicate: Some(TermId(2)),
            ..QuadPattern::default()
        };
        let c = QuadPattern {
            subject: Some(TermId(3)),
            ..QuadPattern::default()
        };
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(QuadPattern::exact(&quad(1, 2, 3, 0)).overlaps(&a));
    }

    #[test]
    fn test_field_letters() {
        for field in Field::ALL {
            assert_eq!(Field::from_letter(field.letter()), Some(field));
        }
        assert_eq!(Field::from_letter('x'), None);
    }
}
