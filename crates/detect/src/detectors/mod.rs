mod approval_bottleneck;
mod overloaded_worker;
mod stuck_workflow;

pub use approval_bottleneck::ApprovalBottleneckDetector;
pub use overloaded_worker::OverloadedWorkerDetector;
pub use stuck_workflow::StuckWorkflowDetector;

/// Entity type used for people in affected-entity lists.
pub const USER_ENTITY: &str = "user";
/// Entity type used for process steps.
pub const PROCESS_STEP_ENTITY: &str = "process_step";

#[allow(clippy::cast_precision_loss)]
fn ratio(value: u64, threshold: u64) -> f64 {
    if threshold == 0 {
        return f64::INFINITY;
    }
    value as f64 / threshold as f64
}
