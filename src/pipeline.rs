//! The reporting pipeline every listener emits into:
//! classify → throttle → transmit-or-spool, plus the local attack log.

use std::sync::Arc;

use log::{debug, info};

use crate::api::ApiClient;
use crate::attack_log::AttackLog;
use crate::classify::classify;
use crate::events::ObservationEvent;
use crate::throttle::{Decision, ThrottleCache};

pub struct Pipeline {
    throttle: Arc<ThrottleCache>,
    api: Arc<ApiClient>,
    attack_log: AttackLog,
    store_throttled: bool,
}

impl Pipeline {
    pub fn new(
        throttle: Arc<ThrottleCache>,
        api: Arc<ApiClient>,
        attack_log: AttackLog,
        store_throttled: bool,
    ) -> Self {
        Self {
            throttle,
            api,
            attack_log,
            store_throttled,
        }
    }

    /// Fire-and-forget entry point for session tasks; the session loop must
    /// never wait on the backend.
    pub fn dispatch(self: &Arc<Self>, event: ObservationEvent) {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline.handle(event).await;
        });
    }

    /// Full pipeline pass for one observation.
    pub async fn handle(&self, event: ObservationEvent) {
        let record = classify(&event);
        let decision = self
            .throttle
            .admit(record.ip_address, &record.attack_type);
        self.attack_log.append(&record, decision.is_admit());

        match decision {
            Decision::Admit => {
                info!(
                    "{} from {} ({} -> {})",
                    record.attack_type, record.ip_address, event.protocol, record.severity
                );
                // report() spools on failure; the error itself is already
                // logged and counted inside the client.
                let _ = self.api.report(&record).await;
            }
            Decision::Suppress(reason) => {
                debug!(
                    "suppressed {} from {}: {reason}",
                    record.attack_type, record.ip_address
                );
                if self.store_throttled {
                    if let Err(err) = self.api.spool_throttled(&record).await {
                        debug!("failed to spool throttled record: {err}");
                    }
                }
            }
        }
    }
}
