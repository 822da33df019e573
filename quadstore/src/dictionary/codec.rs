//! Canonical byte encoding of terms.
//!
//! Every term has exactly one encoding, so dictionary lookups can compare
//! bytes. Strings are UTF-8 with a big-endian `u32` length prefix.
//!
//! ```text
//! 0x01 iri                      [len][iri]
//! 0x02 blank node               [len][label]
//! 0x03 plain literal            [len][label]
//! 0x04 typed literal            [len][label][len][datatype]
//! 0x05 language-tagged literal  [len][label][len][language]
//! 0x06 quoted triple            <subject><predicate><object>
//! ```

use crate::dictionary::DictionaryError;
use crate::types::{Term, XSD_STRING};

/// Largest encoded term accepted.
pub const MAX_TERM_SIZE: usize = 16 * 1024 * 1024;

const TAG_IRI: u8 = 0x01;
const TAG_BLANK: u8 = 0x02;
const TAG_PLAIN: u8 = 0x03;
const TAG_TYPED: u8 = 0x04;
const TAG_LANG: u8 = 0x05;
const TAG_TRIPLE: u8 = 0x06;

/// Quoted triples may nest; decoding stops at this depth.
const MAX_NESTING: usize = 64;

/// Encode a term canonically.
///
/// Rejects literals with both a datatype and a language tag, empty language
/// tags and encodings larger than [`MAX_TERM_SIZE`].
pub fn encode(term: &Term) -> Result<Vec<u8>, DictionaryError> {
    let mut out = Vec::new();
    encode_into(term, &mut out)?;
    if out.len() > MAX_TERM_SIZE {
        return Err(DictionaryError::TermTooLarge { size: out.len() });
    }
    Ok(out)
}

fn encode_into(term: &Term, out: &mut Vec<u8>) -> Result<(), DictionaryError> {
    match term {
        Term::Iri(iri) => {
            out.push(TAG_IRI);
            put_str(out, iri)?;
        }
        Term::BlankNode(label) => {
            out.push(TAG_BLANK);
            put_str(out, label)?;
        }
        Term::Literal {
            label,
            datatype,
            language,
        } => match (datatype.as_deref(), language.as_deref()) {
            (Some(_), Some(_)) => {
                return Err(DictionaryError::InvalidTerm(
                    "literal has both a datatype and a language tag".into(),
                ));
            }
            (_, Some("")) => {
                return Err(DictionaryError::InvalidTerm("empty language tag".into()));
            }
            (None, Some(language)) => {
                out.push(TAG_LANG);
                put_str(out, label)?;
                put_str(out, &language.to_ascii_lowercase())?;
            }
            (None | Some(XSD_STRING), None) => {
                out.push(TAG_PLAIN);
                put_str(out, label)?;
            }
            (Some(datatype), None) => {
                out.push(TAG_TYPED);
                put_str(out, label)?;
                put_str(out, datatype)?;
            }
        },
        Term::Triple(triple) => {
            out.push(TAG_TRIPLE);
            encode_into(&triple.subject, out)?;
            encode_into(&triple.predicate, out)?;
            encode_into(&triple.object, out)?;
        }
    }
    if out.len() > MAX_TERM_SIZE {
        return Err(DictionaryError::TermTooLarge { size: out.len() });
    }
    Ok(())
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), DictionaryError> {
    let len = u32::try_from(s.len()).map_err(|_| DictionaryError::TermTooLarge { size: s.len() })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Decode a canonical encoding. Trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<Term, DictionaryError> {
    let mut reader = Reader { bytes, pos: 0 };
    let term = reader.term(0)?;
    if reader.pos != bytes.len() {
        return Err(DictionaryError::Corruption(format!(
            "{} trailing bytes after term",
            bytes.len() - reader.pos
        )));
    }
    Ok(term)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, len: usize) -> Result<&[u8], DictionaryError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| DictionaryError::Corruption("truncated term encoding".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn string(&mut self) -> Result<String, DictionaryError> {
        let mut len = [0u8; 4];
        len.copy_from_slice(self.take(4)?);
        let bytes = self.take(u32::from_be_bytes(len) as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DictionaryError::Corruption(format!("invalid UTF-8 in term: {e}")))
    }

    fn term(&mut self, depth: usize) -> Result<Term, DictionaryError> {
        if depth > MAX_NESTING {
            return Err(DictionaryError::Corruption("quoted triples nested too deeply".into()));
        }
        let tag = self.take(1)?[0];
        Ok(match tag {
            TAG_IRI => Term::Iri(self.string()?),
            TAG_BLANK => Term::BlankNode(self.string()?),
            TAG_PLAIN => Term::literal(self.string()?),
            TAG_TYPED => {
                let label = self.string()?;
                Term::Literal {
                    label,
                    datatype: Some(self.string()?),
                    language: None,
                }
            }
            TAG_LANG => {
                let label = self.string()?;
                Term::Literal {
                    label,
                    datatype: None,
                    language: Some(self.string()?),
                }
            }
            TAG_TRIPLE => {
                let subject = self.term(depth + 1)?;
                let predicate = self.term(depth + 1)?;
                let object = self.term(depth + 1)?;
                Term::triple(subject, predicate, object)
            }
            other => {
                return Err(DictionaryError::Corruption(format!(
                    "unknown term tag {other:#04x}"
                )));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_variant_decodes_to_itself() {
        let terms = [
            Term::iri("http://example.org/a"),
            Term::blank("node1"),
            Term::literal(""),
            Term::literal("héllo"),
            Term::typed_literal("42", "http://www.w3.org/2001/XMLSchema#integer"),
            Term::lang_literal("bonjour", "fr"),
            Term::triple(
                Term::iri("s"),
                Term::iri("p"),
                Term::triple(Term::blank("x"), Term::iri("q"), Term::literal("o")),
            ),
        ];
        for term in terms {
            let bytes = encode(&term).expect("encode");
            assert_eq!(decode(&bytes).expect("decode"), term);
        }
    }

    #[test]
    fn test_xsd_string_and_plain_encode_identically() {
        let typed = Term::Literal {
            label: "v".into(),
            datatype: Some(XSD_STRING.into()),
            language: None,
        };
        assert_eq!(
            encode(&typed).expect("typed"),
            encode(&Term::literal("v")).expect("plain")
        );
    }

    #[test]
    fn test_variants_do_not_collide() {
        let iri = encode(&Term::iri("x")).expect("iri");
        let blank = encode(&Term::blank("x")).expect("blank");
        let literal = encode(&Term::literal("x")).expect("literal");
        assert_ne!(iri, blank);
        assert_ne!(iri, literal);
        assert_ne!(blank, literal);
    }

    #[test]
    fn test_invalid_literals_rejected() {
        let empty_lang = Term::Literal {
            label: "x".into(),
            datatype: None,
            language: Some(String::new()),
        };
        assert!(matches!(
            encode(&empty_lang),
            Err(DictionaryError::InvalidTerm(_))
        ));

        let both = Term::Literal {
            label: "x".into(),
            datatype: Some("http://dt".into()),
            language: Some("en".into()),
        };
        assert!(matches!(encode(&both), Err(DictionaryError::InvalidTerm(_))));
    }

    #[test]
    fn test_oversized_term_rejected() {
        let term = Term::literal("x".repeat(MAX_TERM_SIZE));
        assert!(matches!(
            encode(&term),
            Err(DictionaryError::TermTooLarge { .. })
        ));
    }

    #[test]
    fn test_truncated_and_trailing_bytes_are_corruption() {
        let bytes = encode(&Term::iri("http://example.org/")).expect("encode");
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(DictionaryError::Corruption(_))
        ));
        let mut extra = bytes;
        extra.push(0);
        assert!(matches!(decode(&extra), Err(DictionaryError::Corruption(_))));
        assert!(matches!(decode(&[0x7F]), Err(DictionaryError::Corruption(_))));
    }
}
