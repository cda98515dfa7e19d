// Utils module - remote access and shared helpers for the orchestration core
pub mod fanout;
pub mod networking;
pub mod passphrase;
pub mod retry;
pub mod ssh;

// Re-export commonly used utilities
pub use fanout::fan_out;
pub use networking::{format_address, mesh_address, mesh_network_prefix};
pub use retry::{RetryPolicy, poll_until, retry_with_backoff};
pub use ssh::{NodeCommunicator, SshCommunicator, shell_escape};
