//! 通用有限状态机：定义、存储契约、副作用端口与转移引擎

pub mod builder;
pub mod effects;
pub mod engine;
pub mod locks;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;
pub mod store;
pub mod types;

pub use builder::DefinitionBuilder;
pub use effects::{RecordingSideEffects, SideEffectCall, SideEffects, TracingSideEffects};
pub use engine::TransitionEngine;
pub use locks::SessionLocks;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;
pub use store::{
    create_stores, load_definitions, DefinitionStore, MemoryDefinitionStore, MemorySessionStore,
    SessionStore,
};
pub use types::{
    AgentSession, CommandId, PhaseId, StateMachineDefinition, TransitionDefinition,
    TransitionResult,
};
