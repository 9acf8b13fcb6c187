pub mod synthesizer;
pub mod translator;

pub use synthesizer::AnswerSynthesizer;
pub use translator::{QueryTranslator, Translation};
