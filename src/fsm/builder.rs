//! 状态机定义构建器
//!
//! 提供流畅的 API 构建 StateMachineDefinition，build 时统一校验

use std::collections::BTreeSet;

use crate::core::DefinitionError;
use crate::fsm::types::*;

/// 状态机定义构建器
pub struct DefinitionBuilder {
    id: String,
    name: String,
    initial_phase: PhaseId,
    terminal_phases: BTreeSet<PhaseId>,
    transitions: Vec<TransitionDefinition>,
}

impl DefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: format!("fsm_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            initial_phase: String::new(),
            terminal_phases: BTreeSet::new(),
            transitions: Vec::new(),
        }
    }

    /// 指定 id（默认随机生成）
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn initial(mut self, phase: impl Into<PhaseId>) -> Self {
        self.initial_phase = phase.into();
        self
    }

    pub fn terminal(mut self, phase: impl Into<PhaseId>) -> Self {
        self.terminal_phases.insert(phase.into());
        self
    }

    /// 添加转移 `from --command--> to`
    pub fn transition(
        mut self,
        from: impl Into<PhaseId>,
        command: impl Into<CommandId>,
        to: impl Into<PhaseId>,
    ) -> Self {
        self.transitions
            .push(TransitionDefinition::new(from, command, to));
        self
    }

    pub fn build(self) -> Result<StateMachineDefinition, DefinitionError> {
        let definition = StateMachineDefinition {
            id: self.id,
            name: self.name,
            initial_phase: self.initial_phase,
            terminal_phases: self.terminal_phases,
            transitions: self.transitions,
        };
        definition.validate()?;
        Ok(definition)
    }
}
