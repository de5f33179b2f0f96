//! Helpers shared by the test suites: listeners that record what a process
//! goes through, and a checker that replays a process from every checkpoint.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};

use crate::bundle::Bundle;
use crate::process::{Process, ProcessClass, ProcessEvent, ProcessListener, ProcessState, Termination, ValueMap};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records a checkpoint of the process on every lifecycle event.
#[derive(Default)]
pub struct ProcessSaver {
    snapshots: Mutex<Vec<(String, Bundle)>>,
}

impl ProcessSaver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Checkpoints in the order taken, labelled with the triggering event.
    pub fn snapshots(&self) -> Vec<(String, Bundle)> {
        lock(&self.snapshots).clone()
    }

    pub fn bundles(&self) -> Vec<Bundle> {
        lock(&self.snapshots).iter().map(|(_, b)| b.clone()).collect()
    }
}

impl ProcessListener for ProcessSaver {
    fn on_process_event(&self, process: &Process, event: &ProcessEvent) -> anyhow::Result<()> {
        let bundle = process.snapshot()?;
        lock(&self.snapshots).push((event.name().to_string(), bundle));
        Ok(())
    }
}

/// Records every event a process fires.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<ProcessEvent>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProcessEvent> {
        lock(&self.events).clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.events).iter().map(ProcessEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        lock(&self.events).iter().filter(|e| e.name() == name).count()
    }
}

impl ProcessListener for EventRecorder {
    fn on_process_event(&self, _process: &Process, event: &ProcessEvent) -> anyhow::Result<()> {
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

/// Play a process to termination, continuing it with `null` whenever it waits.
pub fn run_until_complete(process: &mut Process) -> ProcessState {
    // A process that keeps waiting after this many signals is not going to finish.
    const MAX_CONTINUES: usize = 64;
    let mut state = process.play();
    for _ in 0..MAX_CONTINUES {
        if state != ProcessState::Waiting {
            break;
        }
        state = process.resume().unwrap_or(state);
    }
    state
}

/// What a process ended with: its termination and outputs.
pub fn final_outcome(process: &Process) -> (Option<Termination>, ValueMap) {
    (process.termination(), process.outputs().clone())
}

/// Run `class` with `inputs` once while checkpointing on every event, then
/// restore each checkpoint into a fresh instance, run it to completion and
/// check it ends exactly like the original. Returns the number of checkpoints
/// checked.
pub fn check_process_against_snapshots(class: &ProcessClass, inputs: ValueMap) -> Result<usize> {
    let saver = ProcessSaver::new();
    let mut original = Process::new(class, inputs, None)?;
    original.add_process_listener(saver.clone());
    run_until_complete(&mut original);
    let expected = final_outcome(&original);
    if !original.has_terminated() {
        bail!("{} did not terminate", class.id());
    }

    let snapshots = saver.snapshots();
    for (event, bundle) in &snapshots {
        let mut restored = Process::restore(class, bundle)?;
        let resaved = restored.snapshot()?;
        if &resaved != bundle {
            bail!("checkpoint taken at `{event}` does not survive a restore/save round trip");
        }
        run_until_complete(&mut restored);
        let actual = final_outcome(&restored);
        if actual != expected {
            bail!(
                "restored from `{event}`, {} ended with {:?} instead of {:?}",
                class.id(),
                actual,
                expected
            );
        }
    }
    Ok(snapshots.len())
}
