use std::time::Duration;

use crate::serial::{DeviceIdentity, SignalLines};

/// Baud/signal combinations tried on a path re-resolved by hardware ID, in order.
pub const HARDWARE_ID_COMBOS: [(u32, SignalLines); 4] = [
    (9600, SignalLines::Asserted),
    (9600, SignalLines::Deasserted),
    (115200, SignalLines::Asserted),
    (115200, SignalLines::Deasserted),
];

/// Baud rates for the last-resort matrix, most common first.
pub const MATRIX_BAUDS: [u32; 7] = [9600, 115200, 19200, 38400, 57600, 4800, 2400];

/// Signal modes for the last-resort matrix.
pub const MATRIX_SIGNALS: [SignalLines; 3] = [
    SignalLines::Asserted,
    SignalLines::Deasserted,
    SignalLines::Untouched,
];

/// Every (baud, signals) pair of the brute-force stage.
pub fn matrix_plan() -> impl Iterator<Item = (u32, SignalLines)> {
    MATRIX_BAUDS
        .iter()
        .flat_map(|&baud| MATRIX_SIGNALS.iter().map(move |&sig| (baud, sig)))
}

/// Timing and retry knobs for [`ScaleManager`](super::ScaleManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Baud rate for the plain open of the configured path.
    pub default_baud: u32,
    /// Hardware identity for the rescan stage; `None` skips that stage.
    pub identity: Option<DeviceIdentity>,
    /// Enumeration rounds in the hardware-ID stage.
    pub hardware_id_rounds: u32,
    /// Pause between hardware-ID rounds.
    pub rescan_backoff: Duration,
    /// Minimum spacing between non-forced attempts.
    pub throttle: Duration,
    /// Pause after closing the old handle, before the first open.
    pub teardown_pause: Duration,
    /// Read timeout set on opened handles.
    pub read_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            default_baud: 9600,
            identity: None,
            hardware_id_rounds: 5,
            rescan_backoff: Duration::from_secs(2),
            throttle: Duration::from_secs(10),
            teardown_pause: Duration::from_millis(500),
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl ReconnectPolicy {
    /// Open attempts a fully failed cycle makes with the device present.
    pub fn worst_case_opens(&self) -> usize {
        let hwid = if self.identity.is_some() {
            self.hardware_id_rounds as usize * HARDWARE_ID_COMBOS.len()
        } else {
            0
        };
        1 + hwid + MATRIX_BAUDS.len() * MATRIX_SIGNALS.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_covers_full_product() {
        let plan: Vec<_> = matrix_plan().collect();
        assert_eq!(plan.len(), 21);
        assert_eq!(plan[0], (9600, SignalLines::Asserted));
        assert_eq!(plan[2], (9600, SignalLines::Untouched));
        assert_eq!(plan[3], (115200, SignalLines::Asserted));
        assert_eq!(*plan.last().unwrap(), (2400, SignalLines::Untouched));
    }

    #[test]
    fn worst_case_open_budget() {
        let mut policy = ReconnectPolicy::default();
        assert_eq!(policy.worst_case_opens(), 22);
        policy.identity = Some(DeviceIdentity::new(0x0483, 0x5740));
        assert_eq!(policy.worst_case_opens(), 42);
    }
}
