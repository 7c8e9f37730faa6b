pub mod error;
pub mod logging;
pub mod settings;
pub mod table;
pub mod store;
pub mod records;
pub mod taxonomy;
pub mod llm_client;
pub mod embeddings;
pub mod similarity;
pub mod labeler;
pub mod deriver;
pub mod organizer;
pub mod labeling_pass;
pub mod cleaning;

#[cfg(test)]
mod test_support;

pub use error::{PipelineError, Result};
