pub mod chunker;
pub mod similarity;
pub mod tokens;

pub use chunker::{split, split_with_signal};
pub use similarity::{LexicalJaccard, SimilaritySignal};
pub use tokens::tokenize;
