pub mod pipeline;

pub use pipeline::LlmExtractionPipeline;
