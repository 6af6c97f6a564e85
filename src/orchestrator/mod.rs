//! Build orchestration: admission, the phase state machine and the runner
//! that drives it.

pub mod admission;
pub mod events;
pub mod runner;
pub mod state;

pub use admission::{
    AdmissionController, AdmissionDefaults, Admission, AdmitMode, BuildRequest,
};
pub use events::{BuildEvent, ChannelSink, EventSink, ProgressSink, ValidationStage};
pub use runner::{
    BuildContext, ExecutionMode, Orchestrator, OrchestratorSettings, RunOutcome,
};
pub use state::{BuildState, Phase};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::AdmissionError;

/// Take the build lease for an inline caller and run the build to its end.
/// The lease is only granted on a freshly admitted, unowned build, so a
/// second inline request for the same id is refused instead of racing.
pub async fn run_inline(
    orchestrator: &Orchestrator,
    admission: Admission,
    cancel: CancellationToken,
    sink: &dyn EventSink,
) -> Result<RunOutcome, AdmissionError> {
    let lease = Uuid::new_v4().to_string();
    let acquired = {
        let (id, lease) = (admission.build.id.clone(), lease.clone());
        orchestrator
            .db()
            .call(move |db| db.acquire_build_lease(&id, &lease, false))
            .await
            .map_err(AdmissionError::Store)?
    };
    if !acquired {
        return Err(AdmissionError::BuildAlreadyRunning {
            build_id: admission.build.id,
        });
    }

    let ctx = BuildContext {
        build_id: admission.build.id,
        project_id: admission.build.project_id,
        user_id: admission.build.user_id,
        prompt: admission.build.prompt,
        model: admission.build.model,
        context: admission.context,
        strict_mode: admission.strict_mode,
        max_fix_iterations: admission.max_fix_iterations,
        lease,
        key: admission.key,
        mode: ExecutionMode::Inline,
        cancel,
    };
    Ok(orchestrator.run(&ctx, sink).await)
}
