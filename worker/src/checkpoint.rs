use std::time::Duration;

use comms::{msg::CheckpointStatus, specs::ModelId};
use log::{debug, info};
use tokio::time;

use crate::{error::Result, session::Session};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Saves and restores every table of a model on the server.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    session: Session,
    model_id: ModelId,
    poll_interval: Duration,
}

impl Checkpoint {
    pub fn new(session: Session, model_id: ModelId) -> Self {
        Self {
            session,
            model_id,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// How long to wait before asking again when the server answers `Pending`.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Asks the server to save the model.
    ///
    /// # Returns
    /// `Pending` if another save or load of the model is running, the caller should retry.
    pub async fn save(&self) -> Result<CheckpointStatus> {
        self.session.save(self.model_id).await
    }

    /// Saves the model, retrying until the server accepts.
    pub async fn save_blocked(&self) -> Result<()> {
        while self.save().await? == CheckpointStatus::Pending {
            debug!(model_id = self.model_id.0; "save pending, retrying");
            time::sleep(self.poll_interval).await;
        }

        info!(model_id = self.model_id.0; "checkpoint saved");
        Ok(())
    }

    /// Restores the last saved checkpoint of the model, retrying until the server accepts.
    pub async fn load_blocked(&self) -> Result<()> {
        while self.session.load(self.model_id).await? == CheckpointStatus::Pending {
            debug!(model_id = self.model_id.0; "load pending, retrying");
            time::sleep(self.poll_interval).await;
        }

        info!(model_id = self.model_id.0; "checkpoint loaded");
        Ok(())
    }
}
