//! Mining engine interface.
//!
//! The pool supervisor treats the engine as an external collaborator: it
//! starts and stops it, feeds it work, and reports share outcomes back.
//! The engine reports found solutions and restart requests through
//! registered callbacks; [`wire_engine_events`] adapts those callbacks onto
//! a channel so the manager task can consume them like any other event
//! stream.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::work::{Solution, Work};

/// Execution modes the engine can spin up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Cpu,
    Cuda,
    OpenCl,
}

/// Snapshot of engine throughput.
#[derive(Debug, Clone, Copy, Default)]
pub struct MiningProgress {
    /// Hashes per second across all execution modes.
    pub hash_rate: f64,
}

impl fmt::Display for MiningProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rate = self.hash_rate;
        if rate >= 1e9 {
            write!(f, "{:.2} Gh/s", rate / 1e9)
        } else if rate >= 1e6 {
            write!(f, "{:.2} Mh/s", rate / 1e6)
        } else if rate >= 1e3 {
            write!(f, "{:.2} kh/s", rate / 1e3)
        } else {
            write!(f, "{:.0} h/s", rate)
        }
    }
}

/// Callback invoked when the engine finds a solution. Returning true marks
/// the nonce as consumed by another sink; the pool supervisor always
/// returns false so the engine keeps its own accounting.
pub type SolutionSink = Box<dyn Fn(Solution) -> bool + Send + Sync>;

/// Callback invoked when the engine wants its miners restarted.
pub type RestartHook = Box<dyn Fn() + Send + Sync>;

/// The mining engine as seen from the pool supervisor.
pub trait MiningEngine: Send + Sync {
    /// Spin up miners for the given execution modes.
    fn start(&self, modes: &[EngineMode]);

    /// Stop all miners.
    fn stop(&self);

    fn is_mining(&self) -> bool;

    /// Replace the job the miners are working on.
    fn set_work(&self, work: Work);

    /// A submitted solution was accepted by the pool.
    fn accepted_solution(&self, stale: bool);

    /// A submitted solution was rejected.
    fn rejected_solution(&self, stale: bool);

    /// Register the sink invoked for every found solution.
    fn on_solution_found(&self, sink: SolutionSink);

    /// Register the hook invoked when miners should be restarted.
    fn on_miner_restart(&self, hook: RestartHook);

    /// Current throughput.
    fn mining_progress(&self) -> MiningProgress;

    /// Tell the engine which pool it is mining against.
    fn set_pool_addresses(&self, host: &str, port: u16);
}

/// Engine-originated events, adapted onto a channel.
#[derive(Debug)]
pub enum EngineEvent {
    SolutionFound(Box<Solution>),
    MinerRestart,
}

/// Install channel-forwarding callbacks on the engine.
///
/// The solution sink returns false unconditionally: the nonce is never
/// consumed here, only forwarded for submission.
pub fn wire_engine_events(engine: &dyn MiningEngine, tx: mpsc::UnboundedSender<EngineEvent>) {
    let solution_tx = tx.clone();
    engine.on_solution_found(Box::new(move |solution| {
        let _ = solution_tx.send(EngineEvent::SolutionFound(Box::new(solution)));
        false
    }));

    engine.on_miner_restart(Box::new(move || {
        let _ = tx.send(EngineEvent::MinerRestart);
    }));
}

/// Engine stand-in that mines nothing.
///
/// Keeps the supervisor runnable without hardware: records the work it is
/// given, counts share outcomes, and lets tests inject solutions through
/// the registered sink.
#[derive(Default)]
pub struct DummyEngine {
    mining: AtomicBool,
    accepted: AtomicU64,
    rejected: AtomicU64,
    stale: AtomicU64,
    work: Mutex<Option<Work>>,
    sink: Mutex<Option<SolutionSink>>,
    restart: Mutex<Option<RestartHook>>,
}

impl DummyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a solution into the registered sink, as mining hardware would.
    /// Returns the sink's consumed flag, or false when no sink is set.
    pub fn find_solution(&self, solution: Solution) -> bool {
        match &*self.sink.lock().expect("sink lock") {
            Some(sink) => sink(solution),
            None => false,
        }
    }

    /// Trigger the restart hook.
    pub fn request_restart(&self) {
        if let Some(hook) = &*self.restart.lock().expect("restart lock") {
            hook();
        }
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Acquire)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Acquire)
    }

    pub fn stale_count(&self) -> u64 {
        self.stale.load(Ordering::Acquire)
    }

    pub fn current_work(&self) -> Option<Work> {
        self.work.lock().expect("work lock").clone()
    }
}

impl MiningEngine for DummyEngine {
    fn start(&self, modes: &[EngineMode]) {
        info!(?modes, "Dummy engine started");
        self.mining.store(true, Ordering::Release);
    }

    fn stop(&self) {
        info!("Dummy engine stopped");
        self.mining.store(false, Ordering::Release);
    }

    fn is_mining(&self) -> bool {
        self.mining.load(Ordering::Acquire)
    }

    fn set_work(&self, work: Work) {
        debug!(job = %work.job_id, "Dummy engine received work");
        *self.work.lock().expect("work lock") = Some(work);
    }

    fn accepted_solution(&self, stale: bool) {
        self.accepted.fetch_add(1, Ordering::AcqRel);
        if stale {
            self.stale.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn rejected_solution(&self, stale: bool) {
        self.rejected.fetch_add(1, Ordering::AcqRel);
        if stale {
            self.stale.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn on_solution_found(&self, sink: SolutionSink) {
        *self.sink.lock().expect("sink lock") = Some(sink);
    }

    fn on_miner_restart(&self, hook: RestartHook) {
        *self.restart.lock().expect("restart lock") = Some(hook);
    }

    fn mining_progress(&self) -> MiningProgress {
        MiningProgress::default()
    }

    fn set_pool_addresses(&self, host: &str, port: u16) {
        debug!(host, port, "Dummy engine pool address updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::u256::U256;
    use crate::work::tests::notify_params;

    fn sample_work() -> Work {
        Work::from_notify_params(&notify_params("job1", false), "f000000f", U256::ZERO).unwrap()
    }

    fn sample_solution() -> Solution {
        Solution::new(
            sample_work(),
            "00".into(),
            "00".into(),
            "00".into(),
            [0; 32],
            "tx".into(),
        )
    }

    #[test]
    fn test_progress_display_scales() {
        let fmt = |rate: f64| MiningProgress { hash_rate: rate }.to_string();
        assert_eq!(fmt(500.0), "500 h/s");
        assert_eq!(fmt(2_500.0), "2.50 kh/s");
        assert_eq!(fmt(3_000_000.0), "3.00 Mh/s");
        assert_eq!(fmt(1_500_000_000.0), "1.50 Gh/s");
    }

    #[test]
    fn test_dummy_engine_lifecycle() {
        let engine = DummyEngine::new();
        assert!(!engine.is_mining());

        engine.start(&[EngineMode::Cpu]);
        assert!(engine.is_mining());

        engine.set_work(sample_work());
        assert_eq!(engine.current_work().unwrap().job_id, "job1");

        engine.accepted_solution(false);
        engine.rejected_solution(true);
        assert_eq!(engine.accepted_count(), 1);
        assert_eq!(engine.rejected_count(), 1);
        assert_eq!(engine.stale_count(), 1);

        engine.stop();
        assert!(!engine.is_mining());
    }

    #[tokio::test]
    async fn test_wired_events_reach_channel() {
        let engine = DummyEngine::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        wire_engine_events(&engine, tx);

        // The sink must report the nonce as unconsumed.
        assert!(!engine.find_solution(sample_solution()));
        match rx.recv().await {
            Some(EngineEvent::SolutionFound(solution)) => {
                assert_eq!(solution.job_name(), "job1");
            }
            other => panic!("expected SolutionFound, got {:?}", other),
        }

        engine.request_restart();
        assert!(matches!(rx.recv().await, Some(EngineEvent::MinerRestart)));
    }
}
