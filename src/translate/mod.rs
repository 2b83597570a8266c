pub mod engine;
pub mod interface;
pub mod model;
pub mod processor;
pub mod tokenizer;

pub use engine::TranslationEngine;
