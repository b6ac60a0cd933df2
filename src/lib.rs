pub mod broadcast;
pub mod chunking;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod gemini;
pub mod ingest;
pub mod mirror;
pub mod rag;
pub mod server;
pub mod sse;
pub mod transcript;
pub mod vector_store;
