// src/lib.rs

// Import the top-level `quadracode` module.
pub mod quadracode;

// Re-export the submodules and key items at the crate root so external code
// (and the binary) can use `quadracode::runtime::...` directly.
pub use quadracode::{
    chat, checkpointer, config, envelope, graph, messaging, model, profiles, prompts, registry,
    runtime, store, tools,
};

pub use quadracode::envelope::{mailbox_key, Envelope, EntryId};
pub use quadracode::graph::{build_graph, ReasoningGraph};
pub use quadracode::messaging::MessagingClient;
pub use quadracode::profiles::{load_profile, RuntimeProfile};
pub use quadracode::runtime::{create_runtime, run_forever, RuntimeRunner};
