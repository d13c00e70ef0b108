//! Snapshot-protected execution of one transform stage.

use std::panic::{catch_unwind, AssertUnwindSafe};

use mytx_common::TmuxRequest;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("transform {stage} panicked: {message}")]
    Panic { stage: String, message: String },
    #[error("transform {stage} failed: {message}")]
    Failed { stage: String, message: String },
}

/// Run `stage` against `req` with rollback semantics: on an error or a
/// panic the request is restored to its pre-call value byte for byte and
/// `Err` is returned; partial mutations are never visible to the caller.
pub fn run_stage<F>(name: &str, req: &mut TmuxRequest, stage: F) -> Result<bool, TransformError>
where
    F: FnOnce(&mut TmuxRequest) -> Result<bool, anyhow::Error>,
{
    // all fields are owned maps/vectors, so a clone is a deep snapshot
    let snapshot = req.clone();

    let outcome = catch_unwind(AssertUnwindSafe(|| stage(req)));

    match outcome {
        Ok(Ok(changed)) => Ok(changed),
        Ok(Err(source)) => {
            *req = snapshot;
            Err(TransformError::Failed {
                stage: name.to_string(),
                message: format!("{source:#}"),
            })
        }
        Err(payload) => {
            *req = snapshot;
            Err(TransformError::Panic {
                stage: name.to_string(),
                message: panic_message(payload),
            })
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mytx_common::FlagValue;

    fn sample() -> TmuxRequest {
        let mut req = TmuxRequest::new("split-window");
        req.flags.insert("-h".into(), FlagValue::Bool(true));
        req.args = vec!["claude".into()];
        req.env.insert("A".into(), "1".into());
        req.caller_pane = "%3".into();
        req
    }

    #[test]
    fn successful_stage_keeps_mutations() {
        let mut req = sample();
        let changed = run_stage("test", &mut req, |r| {
            r.args.push("--extra".into());
            Ok(true)
        })
        .unwrap();
        assert!(changed);
        assert_eq!(req.args, vec!["claude", "--extra"]);
    }

    #[test]
    fn erroring_stage_rolls_back_partial_mutations() {
        let mut req = sample();
        let before = req.clone();
        let err = run_stage("broken", &mut req, |r| {
            r.args.clear();
            r.env.insert("B".into(), "2".into());
            r.flags.remove("-h");
            anyhow::bail!("stage exploded")
        })
        .unwrap_err();

        assert!(matches!(err, TransformError::Failed { ref stage, .. } if stage == "broken"));
        assert_eq!(req, before);
    }

    #[test]
    fn panicking_stage_rolls_back_and_reports() {
        let mut req = sample();
        let before = req.clone();
        let err = run_stage("panicky", &mut req, |r| {
            r.caller_pane.clear();
            panic!("boom {}", 42);
        })
        .unwrap_err();

        match err {
            TransformError::Panic { stage, message } => {
                assert_eq!(stage, "panicky");
                assert!(message.contains("boom 42"));
            }
            other => panic!("expected panic error, got {other:?}"),
        }
        assert_eq!(req, before);
    }

    #[test]
    fn unchanged_stage_reports_false() {
        let mut req = sample();
        let changed = run_stage("noop", &mut req, |_| Ok(false)).unwrap();
        assert!(!changed);
    }
}
