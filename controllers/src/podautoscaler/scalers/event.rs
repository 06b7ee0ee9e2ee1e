use resources::objects::gpa::EventMode;

/// Placeholder for event driven scaling. It never has an opinion.
pub struct EventScaler {
    triggers: usize,
}

impl EventScaler {
    pub fn new(mode: &EventMode) -> Self {
        Self {
            triggers: mode.triggers.len(),
        }
    }

    pub fn get_replicas(&self) -> Option<u32> {
        tracing::debug!("Event scaler has {} triggers, no proposal", self.triggers);
        None
    }
}
