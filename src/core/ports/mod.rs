pub mod emitter;
pub mod llm;
pub mod store;
pub mod tools;
