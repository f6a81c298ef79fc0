//! Carrier-sense squelch level.
//!
//! The host requests a threshold in dBm; it is applied to the radio at each
//! retune (the front end needs reprogramming per channel anyway). The RSSI
//! trigger comparison accounts for the front end's fixed offset between
//! register units and dBm.

use crate::hardware::Radio;

/// Default threshold in dBm.
pub const CS_THRESHOLD_DEFAULT: i8 = -120;

/// Offset between raw RSSI register units and dBm at the front end.
const RSSI_OFFSET: i16 = 54;

pub struct Squelch {
    requested: i8,
    current: i8,
}

impl Squelch {
    pub const fn new() -> Squelch {
        Squelch {
            requested: CS_THRESHOLD_DEFAULT,
            current: CS_THRESHOLD_DEFAULT,
        }
    }

    /// Record the host's requested level, clamped to the usable range.
    pub fn set_request(&mut self, level: i8) {
        self.requested = level.max(-120).min(20);
    }

    pub fn requested(&self) -> i8 {
        self.requested
    }

    pub fn current(&self) -> i8 {
        self.current
    }

    /// Program the radio with the requested level. Called as part of every
    /// retune while a hop mode is active.
    pub fn apply<R: Radio>(&mut self, radio: &mut R) {
        self.current = self.requested;
        radio.set_cs_threshold(self.current);
    }

    /// Did this window's peak clear the threshold?
    pub fn rssi_trigger(&self, rssi_max: i8) -> bool {
        rssi_max as i16 >= self.current as i16 + RSSI_OFFSET
    }

    /// The floor threshold means no squelch at all: every capture window
    /// qualifies.
    pub fn no_squelch(&self) -> bool {
        self.requested <= CS_THRESHOLD_DEFAULT
    }

    pub fn reset(&mut self) {
        self.requested = CS_THRESHOLD_DEFAULT;
        self.current = CS_THRESHOLD_DEFAULT;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_clamped() {
        let mut s = Squelch::new();
        s.set_request(-128);
        assert_eq!(s.requested(), -120);
        s.set_request(90);
        assert_eq!(s.requested(), 20);
        s.set_request(-70);
        assert_eq!(s.requested(), -70);
    }

    #[test]
    fn floor_threshold_reads_as_disabled() {
        let mut s = Squelch::new();
        assert!(s.no_squelch());
        s.set_request(-70);
        assert!(!s.no_squelch());
        s.reset();
        assert!(s.no_squelch());
    }

    #[test]
    fn trigger_uses_front_end_offset() {
        let mut s = Squelch::new();
        s.set_request(-100);
        // Not applied yet, still at default.
        assert_eq!(s.current(), CS_THRESHOLD_DEFAULT);
        s.current = s.requested;
        assert!(s.rssi_trigger(-46));
        assert!(!s.rssi_trigger(-47));
    }
}
