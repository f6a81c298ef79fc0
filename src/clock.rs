//! The native clock: a free-running counter at 3200 Hz (312.5 us per tick,
//! half a Bluetooth slot). Everything that needs finer resolution derives a
//! 100 ns timestamp from the low 20 bits of the tick count, which therefore
//! rolls over every 327.68 s.

use crate::flags::Flags;
use crate::hop::HopMode;
use crate::link::{LeLink, LinkPhase};

/// Ticks per second of the native clock.
pub const CLKN_RATE: u32 = 3200;

/// One BTLE time base unit (1.25 ms) in 100 ns units.
pub const LE_BASECLK: u32 = 12_500;

/// Period of the derived 100 ns timestamp: 2^20 ticks * 3125.
pub const CLK100NS_ROLLOVER: u32 = 3_276_800_000;

#[derive(Clone, Copy, Debug, Default)]
pub struct Clock {
    clkn: u32,
    pending_trim: i32,
}

impl Clock {
    pub const fn new() -> Clock {
        Clock {
            clkn: 0,
            pending_trim: 0,
        }
    }

    pub fn clkn(&self) -> u32 {
        self.clkn
    }

    /// High byte of the tick count, stored alongside timestamps so the host
    /// can disambiguate rollovers of the 100 ns field.
    pub fn clkn_high(&self) -> u8 {
        (self.clkn >> 20) as u8
    }

    /// Timestamp in 100 ns units, derived from the low 20 tick bits.
    pub fn clk100ns(&self) -> u32 {
        (self.clkn & 0xf_ffff).wrapping_mul(3125)
    }

    pub fn advance(&mut self) {
        self.clkn = self
            .clkn
            .wrapping_add(1)
            .wrapping_add(self.pending_trim as u32);
        self.pending_trim = 0;
    }

    /// Set the tick counter outright (host synchronization).
    pub fn set(&mut self, clkn: u32) {
        self.clkn = clkn;
    }

    /// Queue a signed adjustment, folded in at the next tick.
    pub fn trim(&mut self, delta: i32) {
        self.pending_trim = self.pending_trim.wrapping_add(delta);
    }
}

/// Elapsed 100 ns units from `prev` to `now`, rollover-aware.
pub fn clk100ns_elapsed(prev: u32, now: u32) -> u32 {
    if now >= prev {
        now - prev
    } else {
        now + (CLK100NS_ROLLOVER - prev)
    }
}

/// One clock tick: advance the counter and raise the hop flag on the cadence
/// the active hop mode calls for.
///
/// The BTLE cadence runs on the 1.25 ms grid (every fourth tick) and counts
/// whole connection events down; at zero the hop is due and the event
/// counter moves. AFH fires once the probe dwell expires. The sweep modes
/// step on a coarse 40 ms grid.
pub fn on_tick(
    clock: &mut Clock,
    hop_mode: HopMode,
    last_hop: u32,
    hop_timeout: u32,
    link: &mut LeLink,
    flags: &Flags,
) {
    clock.advance();
    let clkn = clock.clkn();
    match hop_mode {
        HopMode::Bluetooth => {
            if clkn & 1 == 0 {
                flags.signal_hop();
            }
        }
        HopMode::Btle => {
            if link.phase == LinkPhase::Connected && clkn & 3 == 0 {
                if link.interval_timer == 0 {
                    flags.signal_hop();
                    link.conn_count = link.conn_count.wrapping_add(1);
                    link.interval_timer = link.conn_interval.saturating_sub(1);
                } else {
                    link.interval_timer -= 1;
                }
            }
        }
        HopMode::Afh => {
            if last_hop.wrapping_add(hop_timeout) == clkn {
                flags.signal_hop();
            }
        }
        HopMode::None | HopMode::Sweep => {
            if clkn & 0x7f == 0 {
                flags.signal_hop();
            }
        }
        HopMode::Direct => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LeLink;

    #[test]
    fn clk100ns_tracks_low_tick_bits() {
        let mut c = Clock::new();
        assert_eq!(c.clk100ns(), 0);
        c.advance();
        assert_eq!(c.clk100ns(), 3125);
        c.set(0xf_ffff);
        assert_eq!(c.clk100ns(), CLK100NS_ROLLOVER - 3125);
        c.advance();
        assert_eq!(c.clk100ns(), 0);
        assert_eq!(c.clkn_high(), 1);
    }

    #[test]
    fn trim_is_folded_in_at_the_next_tick() {
        let mut c = Clock::new();
        c.set(100);
        c.trim(-10);
        assert_eq!(c.clkn(), 100, "trim is deferred");
        c.advance();
        assert_eq!(c.clkn(), 91);
        c.advance();
        assert_eq!(c.clkn(), 92);
    }

    #[test]
    fn elapsed_handles_rollover() {
        assert_eq!(clk100ns_elapsed(100, 500), 400);
        let prev = CLK100NS_ROLLOVER - 1000;
        assert_eq!(clk100ns_elapsed(prev, 500), 1500);
    }

    #[test]
    fn btle_cadence_counts_whole_events() {
        let mut clock = Clock::new();
        let flags = Flags::new();
        let mut link = LeLink::default();
        link.phase = LinkPhase::Connected;
        link.conn_interval = 6;
        link.interval_timer = 5;

        let mut hops = 0;
        for _ in 0..(6 * 4 * 3) {
            on_tick(&mut clock, HopMode::Btle, 0, 0, &mut link, &flags);
            if flags.hop_pending() {
                hops += 1;
                flags.clear_hop();
            }
        }
        // Three whole intervals of 6 * 1.25 ms each.
        assert_eq!(hops, 3);
        assert_eq!(link.conn_count, 3);
    }

    #[test]
    fn afh_cadence_fires_at_dwell_expiry() {
        let mut clock = Clock::new();
        let flags = Flags::new();
        let mut link = LeLink::default();
        let last_hop = 10;
        for _ in 0..200 {
            on_tick(&mut clock, HopMode::Afh, last_hop, 158, &mut link, &flags);
            if flags.hop_pending() {
                break;
            }
        }
        assert_eq!(clock.clkn(), last_hop + 158);
    }
}
