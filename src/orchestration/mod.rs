//! 编排状态机：loadContext → idle → running.{detectIntent → greeting | summarizeIntent | readData → streaming} → stopped
//!
//! - `machine`：纯 reducer，只产出 Effect
//! - `runtime`：每个会话一个任务，执行 Effect、管理在途 actor
//! - `registry`：会话到实例的映射与生命周期

pub mod actors;
pub mod events;
pub mod machine;
pub mod registry;
pub mod rules;
pub mod runtime;
pub mod state;

pub use actors::{ContextLoader, EmptyContextLoader, IntentClassifier, PhaseActors, TurnGenerator};
pub use events::{ActorJob, Effect, MachineInput, OrchestrationEvent, TurnEvent, TurnStream};
pub use machine::OrchestrationMachine;
pub use registry::OrchestrationRegistry;
pub use rules::{rule_based_actors, KeywordIntentClassifier, TemplateGenerator};
pub use runtime::{spawn, OrchestratorHandle, OrchestratorOptions};
pub use state::{
    AgentContext, Intent, IntentClassification, OrchestrationState, RunningPhase, StateSnapshot,
    StreamResult,
};
