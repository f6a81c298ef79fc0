//! Channel scheduling and the retune protocol.
//!
//! The hop flag is raised by the clock cadence (or directly, for immediate
//! retunes); [`hop`] consumes it, picks the next channel for the active hop
//! mode and walks the radio through the fixed retune sequence. The first
//! capture window after a retune is always marked discard, its symbols
//! straddle the tune.

use crate::codec::btle_channel_index_to_phys;
use crate::flags::Flags;
use crate::hardware::Radio;
use crate::link::LeLink;
use crate::squelch::Squelch;

pub const MIN_CHANNEL: u16 = 2402;
pub const MAX_CHANNEL: u16 = 2480;
pub const DEFAULT_CHANNEL: u16 = 2441;

/// Default AFH probe dwell, in clock ticks.
pub const HOP_TIMEOUT_DEFAULT: u32 = 158;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HopMode {
    None,
    Sweep,
    Bluetooth,
    Btle,
    Direct,
    Afh,
}

pub struct HopSchedule {
    pub mode: HopMode,
    pub channel: u16,
    pub direct_channel: u16,
    pub timeout: u32,
    pub last_hop: u32,
    afh_map: [u8; 10],
    pub afh_enabled: bool,
    used_channels: u8,
}

impl Default for HopSchedule {
    fn default() -> HopSchedule {
        HopSchedule {
            mode: HopMode::None,
            channel: DEFAULT_CHANNEL,
            direct_channel: 0,
            timeout: HOP_TIMEOUT_DEFAULT,
            last_hop: 0,
            afh_map: [0; 10],
            afh_enabled: false,
            used_channels: 0,
        }
    }
}

impl HopSchedule {
    /// Back to the resting schedule. The AFH map is host state and has its
    /// own clear command, so it survives.
    pub fn reset(&mut self) {
        self.mode = HopMode::None;
        self.channel = DEFAULT_CHANNEL;
        self.direct_channel = 0;
        self.timeout = HOP_TIMEOUT_DEFAULT;
        self.last_hop = 0;
    }

    /// Is `channel` marked used in the AFH map?
    pub fn map_bit(&self, channel: u16) -> bool {
        let i = (channel - MIN_CHANNEL) as usize;
        self.afh_map[i / 8] & (1 << (i % 8)) != 0
    }

    pub fn set_afh_map(&mut self, map: [u8; 10]) {
        self.afh_map = map;
        self.used_channels = map.iter().map(|b| b.count_ones() as u8).sum();
        self.afh_enabled = true;
    }

    pub fn clear_afh_map(&mut self) {
        self.afh_map = [0; 10];
        self.used_channels = 0;
        self.afh_enabled = false;
    }

    pub fn afh_map(&self) -> &[u8; 10] {
        &self.afh_map
    }

    /// Mark a channel used (the AFH prober's verdict for a live window).
    pub fn mark_used(&mut self, channel: u16) {
        if (MIN_CHANNEL..=MAX_CHANNEL).contains(&channel) && !self.map_bit(channel) {
            let i = (channel - MIN_CHANNEL) as usize;
            self.afh_map[i / 8] |= 1 << (i % 8);
            self.used_channels += 1;
        }
    }

    pub fn used_channels(&self) -> u8 {
        self.used_channels
    }

    /// One step of the 32 MHz sweep walk (coprime with the 79-channel band,
    /// so it visits every channel).
    fn sweep_step(channel: u16) -> u16 {
        let c = channel + 32;
        if c > MAX_CHANNEL {
            c - 79
        } else {
            c
        }
    }
}

/// Consume the hop flag: pick the next channel for the active mode and
/// retune. `tx` selects the final strobe.
pub fn hop<R: Radio>(
    radio: &mut R,
    hop: &mut HopSchedule,
    link: &mut LeLink,
    squelch: &mut Squelch,
    flags: &Flags,
    clkn: u32,
    tx: bool,
) {
    flags.clear_hop();
    hop.last_hop = clkn;

    match hop.mode {
        HopMode::None => {
            // Stay put if already tuned.
            if radio.frequency() == hop.channel {
                return;
            }
        }
        HopMode::Sweep => {
            // With an AFH map in force, sweep only the used channels.
            loop {
                hop.channel = HopSchedule::sweep_step(hop.channel);
                if hop.used_channels == 0 || !hop.afh_enabled || hop.map_bit(hop.channel) {
                    break;
                }
            }
        }
        HopMode::Bluetooth => {
            hop.channel = radio.classic_next_hop(clkn);
        }
        HopMode::Btle => {
            link.channel_idx = (link.channel_idx + link.channel_increment) % 37;
            hop.channel = btle_channel_index_to_phys(link.channel_idx);
        }
        HopMode::Direct => {
            hop.channel = hop.direct_channel;
        }
        HopMode::Afh => {
            // Probe channels not yet known used, unless the map is complete.
            loop {
                hop.channel = HopSchedule::sweep_step(hop.channel);
                if hop.used_channels == 79 || !hop.map_bit(hop.channel) {
                    break;
                }
            }
        }
    }

    retune(radio, hop, squelch, flags, tx);
}

/// The fixed retune sequence: synthesizer off, unlock, program, squelch,
/// synthesizer on, lock, discard-mark, strobe.
pub fn retune<R: Radio>(
    radio: &mut R,
    hop: &mut HopSchedule,
    squelch: &mut Squelch,
    flags: &Flags,
    tx: bool,
) {
    radio.strobe_off();
    radio.wait_unlock();
    radio.set_frequency(hop.channel);
    if hop.mode != HopMode::None {
        squelch.apply(radio);
    }
    radio.strobe_fs_on();
    radio.wait_lock();
    flags.set_discard();
    if tx {
        radio.strobe_tx();
    } else {
        radio.strobe_rx();
    }
}
