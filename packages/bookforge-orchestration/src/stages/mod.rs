// Stage executors
pub mod command;
pub mod job;

// Re-exports
pub use command::{CommandStage, EXIT_FATAL, EXIT_RATE_LIMITED};
pub use job::{StageJob, StageJobHandler};

use crate::config::StageCommand;
use crate::error::Result;
use crate::pipeline::StageRegistry;
use crate::stage::StageId;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Build a registry of external-program stages from configuration
pub fn registry_from_commands(commands: &BTreeMap<String, StageCommand>) -> Result<StageRegistry> {
    let mut registry = StageRegistry::new();
    for (name, command) in commands {
        let stage = StageId::from_str(name)?;
        let mut handler = CommandStage::new(stage, command.program.clone(), command.args.clone());
        if let Some(service) = &command.service {
            handler = handler.with_service(service.clone());
        }
        registry.register(Arc::new(handler))?;
    }
    Ok(registry)
}
