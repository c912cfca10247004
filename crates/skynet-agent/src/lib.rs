//! Anthropic <-> OpenAI streaming translator and the provider-side rate limiter (C2, C4-C9).
//!
//! §1 Non-goals: one upstream provider per process — this is a translator,
//! not a multi-provider router.

pub mod anthropic;
pub mod blocks;
pub mod converter;
pub mod error;
pub mod heuristic;
pub mod limiter;
pub mod openai;
pub mod sse;
pub mod think;
pub mod translator;

pub use error::ProviderError;
pub use limiter::ProviderLimiter;
pub use translator::translate_stream;
