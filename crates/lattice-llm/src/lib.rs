pub mod anthropic;
pub mod testing;

pub use anthropic::AnthropicModel;
pub use testing::{ScriptedModel, ScriptedReply};
