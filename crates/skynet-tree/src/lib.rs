//! Conversation tree & FIFO queue: each chat's reply thread is a tree of
//! [`MessageNode`]s, processed one at a time per tree, with replies to a
//! busy tree queued rather than run concurrently (§3, §4.12).

pub mod error;
pub mod manager;
pub mod node;
pub mod repository;
pub mod tree;

pub use error::TreeError;
pub use manager::{NodeProcessor, NodeStartedCallback, QueueUpdateCallback, TreeQueueManager};
pub use node::MessageNode;
pub use repository::TreeRepository;
pub use tree::MessageTree;
