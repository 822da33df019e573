//! RDF terms.
//!
//! A term is an immutable value: an IRI, a blank node, a literal or a quoted
//! triple. Equality is structural. Literals typed `xsd:string` are stored as
//! plain literals, so both spellings of the same value are one term.

use std::fmt;

/// Datatype IRI of plain string literals.
pub const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";

/// Datatype IRI of language-tagged literals.
pub const RDF_LANG_STRING: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#langString";

/// An RDF term.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    /// An IRI, without angle brackets.
    Iri(String),
    /// A blank node label, without the `_:` prefix.
    BlankNode(String),
    /// A literal. At most one of `datatype` and `language` is set.
    Literal {
        label: String,
        datatype: Option<String>,
        language: Option<String>,
    },
    /// An RDF-star quoted triple.
    Triple(Box<Triple>),
}

/// Subject, predicate and object of a quoted triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Triple {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
}

impl Term {
    /// An IRI term.
    #[must_use]
    pub fn iri(iri: impl Into<String>) -> Self {
        Self::Iri(iri.into())
    }

    /// A blank node term.
    #[must_use]
    pub fn blank(label: impl Into<String>) -> Self {
        Self::BlankNode(label.into())
    }

    /// A plain literal.
    #[must_use]
    pub fn literal(label: impl Into<String>) -> Self {
        Self::Literal {
            label: label.into(),
            datatype: None,
            language: None,
        }
    }

    /// A typed literal. `xsd:string` yields a plain literal.
    #[must_use]
    pub fn typed_literal(label: impl Into<String>, datatype: impl Into<String>) -> Self {
        let datatype = datatype.into();
        Self::Literal {
            label: label.into(),
            datatype: (datatype != XSD_STRING).then_some(datatype),
            language: None,
        }
    }

    /// A language-tagged literal. The tag is lower-cased.
    #[must_use]
    pub fn lang_literal(label: impl Into<String>, language: impl Into<String>) -> Self {
        Self::Literal {
            label: label.into(),
            datatype: None,
            language: Some(language.into().to_ascii_lowercase()),
        }
    }

    /// A quoted triple.
    #[must_use]
    pub fn triple(subject: Self, predicate: Self, object: Self) -> Self {
        Self::Triple(Box::new(Triple {
            subject,
            predicate,
            object,
        }))
    }

    /// The same term with `xsd:string` datatypes removed, recursively.
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Literal {
                label,
                datatype: Some(datatype),
                language,
            } if datatype == XSD_STRING => Self::Literal {
                label,
                datatype: None,
                language,
            },
            Self::Triple(triple) => {
                let Triple {
                    subject,
                    predicate,
                    object,
                } = *triple;
                Self::triple(
                    subject.normalized(),
                    predicate.normalized(),
                    object.normalized(),
                )
            }
            other => other,
        }
    }

    #[must_use]
    pub const fn is_literal(&self) -> bool {
        matches!(self, Self::Literal { .. })
    }

    /// Datatype IRI of a literal, implicit ones included.
    #[must_use]
    pub fn datatype(&self) -> Option<&str> {
        match self {
            Self::Literal {
                datatype: Some(datatype),
                ..
            } => Some(datatype),
            Self::Literal {
                language: Some(_), ..
            } => Some(RDF_LANG_STRING),
            Self::Literal { .. } => Some(XSD_STRING),
            _ => None,
        }
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            _ => write!(f, "{c}")?,
        }
    }
    Ok(())
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iri(iri) => write!(f, "<{iri}>"),
            Self::BlankNode(label) => write!(f, "_:{label}"),
            Self::Literal {
                label,
                datatype,
                language,
            } => {
                f.write_str("\"")?;
                write_escaped(f, label)?;
                f.write_str("\"")?;
                if let Some(language) = language {
                    write!(f, "@{language}")
                } else if let Some(datatype) = datatype {
                    write!(f, "^^<{datatype}>")
                } else {
                    Ok(())
                }
            }
            Self::Triple(triple) => write!(
                f,
                "<< {} {} {} >>",
                triple.subject, triple.predicate, triple.object
            ),
        }
    }
}
