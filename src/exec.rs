//! # Switchable batch execution strategy
//!
//! Spectral normalization is embarrassingly parallel: each star is a pure
//! function of its own pixels. [`run_batch`] maps a fallible task over a
//! batch of inputs under an [`ExecPolicy`] chosen by configuration:
//!
//! * [`ExecPolicy::Serial`] — everything on the caller's thread. Stack
//!   traces point at the real call site and the debugger works, so this is
//!   the mode to reach for when a batch misbehaves.
//! * [`ExecPolicy::Threaded`] — a dedicated rayon pool. `workers == 0`
//!   means "use the available parallelism".
//!
//! Results are returned **in submission order** regardless of completion
//! order. If any task fails, the failing input's index is logged and the
//! error is returned wrapped in [`ParallaxError::TaskFailed`]; rayon stops
//! handing out not-yet-started items once the collection short-circuits, so
//! cancellation of the remainder is advisory, never preemptive.

use log::warn;
use rayon::prelude::*;

use crate::parallax_errors::ParallaxError;

/// Execution strategy for independent batch work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecPolicy {
    /// Run every task on the calling thread, in order.
    Serial,
    /// Run tasks on a rayon pool with the given worker count (0 = available
    /// parallelism).
    Threaded { workers: usize },
}

impl Default for ExecPolicy {
    fn default() -> Self {
        ExecPolicy::Threaded { workers: 0 }
    }
}

impl ExecPolicy {
    /// Effective worker count for this policy.
    pub fn workers(&self) -> usize {
        match self {
            ExecPolicy::Serial => 1,
            ExecPolicy::Threaded { workers: 0 } => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            ExecPolicy::Threaded { workers } => *workers,
        }
    }
}

/// Map `task` over `inputs`, collecting results in input order.
///
/// Arguments
/// -----------------
/// * `policy`: execution strategy (serial or threaded).
/// * `inputs`: the batch; each element is handed to `task` exactly once.
/// * `task`: pure function of one input. Must not share mutable state.
///
/// Return
/// ----------
/// * `Ok(results)` in submission order, or the first failure (by input
///   index) wrapped in [`ParallaxError::TaskFailed`].
pub fn run_batch<T, R, F>(
    policy: ExecPolicy,
    inputs: Vec<T>,
    task: F,
) -> Result<Vec<R>, ParallaxError>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R, ParallaxError> + Send + Sync,
{
    match policy {
        ExecPolicy::Serial => inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| task(input).map_err(|e| task_failed(index, e)))
            .collect(),
        ExecPolicy::Threaded { .. } => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(policy.workers())
                .build()
                .map_err(|e| ParallaxError::ExternalService(format!("thread pool: {e}")))?;

            pool.install(|| {
                inputs
                    .into_par_iter()
                    .enumerate()
                    .map(|(index, input)| task(input).map_err(|e| task_failed(index, e)))
                    .collect()
            })
        }
    }
}

fn task_failed(index: usize, source: ParallaxError) -> ParallaxError {
    warn!("batch task {index} failed: {source}");
    ParallaxError::TaskFailed {
        index,
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_and_threaded_agree_and_preserve_order() {
        let inputs: Vec<i64> = (0..100).collect();
        let serial = run_batch(ExecPolicy::Serial, inputs.clone(), |x| Ok(x * x)).unwrap();
        let threaded = run_batch(
            ExecPolicy::Threaded { workers: 4 },
            inputs.clone(),
            |x| Ok(x * x),
        )
        .unwrap();
        assert_eq!(serial, threaded);
        assert_eq!(serial, inputs.iter().map(|x| x * x).collect::<Vec<_>>());
    }

    #[test]
    fn failure_reports_the_input_index() {
        let inputs: Vec<i64> = (0..10).collect();
        let result = run_batch(ExecPolicy::Serial, inputs, |x| {
            if x == 7 {
                Err(ParallaxError::InvalidCatalog("boom".to_string()))
            } else {
                Ok(x)
            }
        });
        match result {
            Err(ParallaxError::TaskFailed { index, .. }) => assert_eq!(index, 7),
            other => panic!("expected TaskFailed, got {other:?}"),
        }
    }

    #[test]
    fn zero_workers_means_available_parallelism() {
        assert!(ExecPolicy::Threaded { workers: 0 }.workers() >= 1);
        assert_eq!(ExecPolicy::Serial.workers(), 1);
    }
}
