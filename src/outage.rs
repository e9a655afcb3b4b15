//! Outage state derived from the most recent submission outcome

use crate::bus::{BusMessage, NotificationBus, OUTAGE_CODE, OutageFault};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

#[derive(Debug)]
pub struct OutageTracker {
    outage: AtomicBool,
    bus: NotificationBus,
}

impl OutageTracker {
    pub fn new(bus: NotificationBus) -> Self {
        Self {
            outage: AtomicBool::new(false),
            bus,
        }
    }

    pub fn is_outage(&self) -> bool {
        self.outage.load(Ordering::Acquire)
    }

    /// Set the outage flag, broadcasting on an actual transition.
    /// Returns whether the state changed.
    pub fn set_outage(&self, outage: bool) -> bool {
        let previous = self.outage.swap(outage, Ordering::AcqRel);
        if previous == outage {
            return false;
        }

        if outage {
            warn!("Collector outage detected");
            self.bus.publish(BusMessage::OutageStarted(OutageFault {
                code: OUTAGE_CODE,
                message: "event collector is unreachable or rejecting batches".to_string(),
            }));
        } else {
            info!("Collector outage ended");
            self.bus.publish(BusMessage::OutageEnded);
        }

        true
    }
}
