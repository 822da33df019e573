//! Core value types shared by every layer.

mod ids;
mod quad;
mod term;

pub use ids::TermId;
pub use quad::{Field, Quad, QuadPattern, Statement};
pub use term::{RDF_LANG_STRING, Term, Triple, XSD_STRING};
