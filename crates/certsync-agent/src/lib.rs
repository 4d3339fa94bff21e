// # certsync-agent
//
// Pull-based deployment agent. Each poll cycle:
//
// 1. Fetch the desired state from the server
// 2. Download bundles whose fingerprint differs from the locally deployed one
// 3. Write them under the binding's deploy path
// 4. Run each distinct reload command once
// 5. Report per-certificate outcomes and send a heartbeat
//
// Everything the agent needs from the outside world sits behind a trait
// (`ServerApi`, `Reloader`) so the runner can be driven in tests without a
// network or a shell.

pub mod client;
pub mod deploy;
pub mod reload;
pub mod runner;
pub mod state;

pub use client::{HttpServerApi, ServerApi};
pub use reload::{Reloader, ShellReloader};
pub use runner::{AgentRunner, CycleReport};
pub use state::LocalState;
