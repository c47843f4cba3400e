//! 核心层：错误类型、actor 取消监管

pub mod error;
pub mod supervisor;

pub use error::{ActorError, DefinitionError, EngineError, OrchestrationError, ProtocolError};
pub use supervisor::ActorSupervisor;
