//! Quad indexes: one B-tree per configured field permutation.

mod permutation;
mod set;

pub use permutation::{
    DEFAULT_PERMUTATIONS, Permutation, PermutationError, best_index, parse_permutations,
};
pub use set::{QuadIndexSet, QuadScan, is_explicit};
