//! Checkpoint lifecycle: epoch cadence, rolling step cadence, final save
//!
//! Three independent artifact kinds share one output directory and filename
//! prefix: `{prefix}_epoch_{E}.ckpt` (one per qualifying epoch, never
//! overwritten), `{prefix}_latest.ckpt` (rolling, overwritten on each
//! qualifying step), and `{prefix}_final.ckpt` (written exactly once after
//! the run). Every write is synchronous and strictly ordered with its
//! triggering event; any failure propagates immediately, since a dropped
//! checkpoint must never be mistaken for a successful one.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Full recoverable state captured at an epoch/step boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSnapshot {
    /// Epoch the state reflects
    pub epoch: usize,
    /// Global step the state reflects
    pub global_step: usize,
    /// Serialized model parameters (safetensors payload)
    pub model_state: Vec<u8>,
    /// Capture timestamp
    pub created_at: DateTime<Utc>,
}

impl TrainingSnapshot {
    /// Encode the snapshot into checkpoint bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| Error::persistence(format!("failed to encode snapshot: {e}")))
    }

    /// Decode a snapshot from checkpoint bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::persistence(format!("failed to decode snapshot: {e}")))
    }
}

/// Source of recoverable state, queried at the moment a save fires.
///
/// Keeping this a parameter of every save operation (rather than ambient
/// trainer state) is what lets the saver be exercised without an engine or a
/// model behind it.
pub trait Checkpointable {
    /// Produce the full recoverable state as of the given epoch and step
    fn recoverable_state(&self, epoch: usize, global_step: usize) -> Result<Vec<u8>>;
}

/// Persists recoverable training state on epoch and step cadences, plus a
/// guaranteed final save.
pub struct CheckpointSaver {
    output_path: PathBuf,
    filename_prefix: String,
    save_every_n_epochs: usize,
    save_every_n_steps: Option<usize>,
}

impl CheckpointSaver {
    /// Create a saver, creating the output directory if absent.
    ///
    /// Cadences must be positive; a step cadence of `None` disables
    /// step-triggered saves entirely.
    pub fn new(
        output_path: impl AsRef<Path>,
        filename_prefix: impl Into<String>,
        save_every_n_epochs: usize,
        save_every_n_steps: Option<usize>,
    ) -> Result<Self> {
        if save_every_n_epochs == 0 {
            return Err(Error::config("epoch checkpoint cadence must be positive"));
        }
        if save_every_n_steps == Some(0) {
            return Err(Error::config("step checkpoint cadence must be positive"));
        }

        let output_path = output_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&output_path)?;

        Ok(Self {
            output_path,
            filename_prefix: filename_prefix.into(),
            save_every_n_epochs,
            save_every_n_steps,
        })
    }

    /// Path of the epoch artifact for a given epoch
    pub fn epoch_path(&self, epoch: usize) -> PathBuf {
        self.output_path
            .join(format!("{}_epoch_{epoch}.ckpt", self.filename_prefix))
    }

    /// Path of the rolling "latest" artifact
    pub fn latest_path(&self) -> PathBuf {
        self.output_path
            .join(format!("{}_latest.ckpt", self.filename_prefix))
    }

    /// Path of the "final" artifact
    pub fn final_path(&self) -> PathBuf {
        self.output_path
            .join(format!("{}_final.ckpt", self.filename_prefix))
    }

    /// Epoch-end hook: writes a distinct epoch artifact when the epoch
    /// matches the cadence.
    ///
    /// Every save records both counters, so resuming from any artifact sees
    /// the true position in the run.
    pub fn on_epoch_end(
        &self,
        epoch: usize,
        global_step: usize,
        state: &dyn Checkpointable,
    ) -> Result<()> {
        if epoch % self.save_every_n_epochs != 0 {
            return Ok(());
        }

        let path = self.epoch_path(epoch);
        self.write(&path, state, epoch, global_step)?;
        info!("Saved epoch checkpoint {:?}", path);
        Ok(())
    }

    /// Step-end hook: overwrites the rolling "latest" artifact when the step
    /// matches the cadence; never fires with the cadence disabled
    pub fn on_step_end(
        &self,
        epoch: usize,
        global_step: usize,
        state: &dyn Checkpointable,
    ) -> Result<()> {
        let Some(cadence) = self.save_every_n_steps else {
            return Ok(());
        };
        if global_step % cadence != 0 {
            return Ok(());
        }

        let path = self.latest_path();
        self.write(&path, state, epoch, global_step)?;
        debug!("Saved latest checkpoint at step {global_step}");
        Ok(())
    }

    /// Explicit final save, to be invoked exactly once after the run
    /// completes; independent of cadence alignment
    pub fn save_final(
        &self,
        epoch: usize,
        global_step: usize,
        state: &dyn Checkpointable,
    ) -> Result<()> {
        let path = self.final_path();
        let bytes = state
            .recoverable_state(epoch, global_step)
            .map_err(|e| Error::persistence(format!("failed to capture state: {e}")))?;
        std::fs::write(&path, bytes)
            .map_err(|e| Error::persistence(format!("failed to write {path:?}: {e}")))?;
        info!("Saved final checkpoint {:?}", path);
        Ok(())
    }

    fn write(
        &self,
        path: &Path,
        state: &dyn Checkpointable,
        epoch: usize,
        global_step: usize,
    ) -> Result<()> {
        let bytes = state
            .recoverable_state(epoch, global_step)
            .map_err(|e| Error::persistence(format!("failed to capture state: {e}")))?;
        std::fs::write(path, bytes)
            .map_err(|e| Error::persistence(format!("failed to write {path:?}: {e}")))?;
        Ok(())
    }
}
