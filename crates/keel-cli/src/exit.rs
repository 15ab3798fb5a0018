//! Process exit codes.
//!
//! | code | meaning |
//! |------|---------|
//! | 0 | success |
//! | 1 | render, validation, credential, configuration or usage error |
//! | 2 | apply failure (including readiness timeout and cancellation) or failed builds |
//! | 3 | dependency cycle |

use keel_core::CoreError;
use keel_pipeline::{PipelineError, RunFailure};
use keel_release::ReleaseError;

pub const USAGE: u8 = 1;
pub const APPLY: u8 = 2;
pub const CYCLE: u8 = 3;

pub fn code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(err) = cause.downcast_ref::<ReleaseError>() {
            return match err {
                ReleaseError::Core(core) => core_code(core),
                ReleaseError::Apply { .. } => APPLY,
                _ => USAGE,
            };
        }
        if let Some(err) = cause.downcast_ref::<PipelineError>() {
            return match err {
                PipelineError::Core(core) => core_code(core),
                _ => USAGE,
            };
        }
        if let Some(err) = cause.downcast_ref::<CoreError>() {
            return core_code(err);
        }
    }
    USAGE
}

pub fn for_run_failure(failure: &RunFailure) -> u8 {
    match failure {
        RunFailure::Render { cycle: true, .. } => CYCLE,
        RunFailure::Render { .. } | RunFailure::Credential { .. } | RunFailure::Release { .. } => {
            USAGE
        }
        RunFailure::Build { .. } | RunFailure::Apply { .. } | RunFailure::Cancelled => APPLY,
    }
}

fn core_code(err: &CoreError) -> u8 {
    if err.is_cycle() { CYCLE } else { USAGE }
}
