pub mod oracle;
pub mod retrieval;

pub use oracle::{AnthropicOracle, Assessment, CoherenceOracle, MockOracle};
pub use retrieval::{ContextRetriever, ContextSnippet, HttpRetriever, NullRetriever};
