//! Maps engine lifecycle notifications onto pipeline start/stop.

use duplex_common::{Error, Result};
use tracing::{error, info};

use crate::engine::{EngineEvent, MediaEngine, PipelineState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleOutcome {
    Continue,
    /// The pipeline drained; the process should exit cleanly.
    Finished,
    Failed(Error),
}

#[derive(Debug)]
pub struct PipelineLifecycle {
    state: PipelineState,
    started: bool,
}

impl Default for PipelineLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineLifecycle {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Stopped,
            started: false,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Start the pipeline. Only the first call for a session does anything.
    pub fn start(&mut self, engine: &mut dyn MediaEngine) -> Result<bool> {
        if self.started {
            return Ok(false);
        }
        self.started = true;
        engine.start()?;
        self.state = PipelineState::Running;
        info!("pipeline started");
        Ok(true)
    }

    /// Stop the pipeline if it is running. Safe to call any number of times.
    pub fn stop(&mut self, engine: &mut dyn MediaEngine) -> Result<bool> {
        if self.state == PipelineState::Stopped {
            return Ok(false);
        }
        self.state = PipelineState::Stopped;
        engine.stop()?;
        info!("pipeline stopped");
        Ok(true)
    }

    pub fn on_engine_event(
        &mut self,
        engine: &mut dyn MediaEngine,
        event: &EngineEvent,
    ) -> LifecycleOutcome {
        match event {
            EngineEvent::StateChanged { from, to } => {
                info!("pipeline state changed from {} to {}", from, to);
                LifecycleOutcome::Continue
            }
            EngineEvent::EndOfStream => {
                info!("end of stream");
                match self.stop(engine) {
                    Ok(_) => LifecycleOutcome::Finished,
                    Err(e) => LifecycleOutcome::Failed(e),
                }
            }
            EngineEvent::Error { source, message } => {
                error!("error from {}: {}", source, message);
                if let Err(e) = self.stop(engine) {
                    error!("failed to stop pipeline: {}", e);
                }
                LifecycleOutcome::Failed(Error::engine(format!("{source}: {message}")))
            }
            _ => LifecycleOutcome::Continue,
        }
    }
}
