pub mod coordinator;
pub mod dispatch;
pub mod models;
pub mod probe;
pub mod registry;
pub mod transition;

pub use coordinator::{
    Coordinator, CoordinatorHandle, EngineConfig, EngineError, EngineHealth, EngineState,
};
pub use models::{CheckResult, MonitoredTarget, TargetId, TargetStatus, TransitionEvent};
pub use probe::{HttpProbe, ProbeExecutor};
