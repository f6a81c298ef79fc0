//! Hardware abstraction boundary.
//!
//! The engine is generic over [`Radio`], which covers the transceiver
//! strobe/register surface, symbol capture, and the event pump that stands
//! in for the interrupt sources (clock timer, capture transfers, carrier
//! sense, host requests). A chip shim implements it against real silicon;
//! tests drive the engine with the scripted [`mock::MockRadio`].

use crate::capture::BUF_LEN;
use crate::{Mode, Modulation};

/// One pending hardware event. The embedding converts its interrupt sources
/// into these; the engine drains them between protocol steps and only ever
/// flips flags or swaps buffers in response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HwEvent {
    /// Nothing pending. Mode loops yield back to the caller on this.
    Idle,
    /// One 312.5 us clock tick.
    TimerTick,
    /// A capture window finished transferring.
    TransferComplete,
    /// A capture transfer failed.
    TransferError,
    /// The front end's carrier-sense comparator fired.
    CsTrigger,
    /// The host asked for a mode switch.
    HostRequest(Mode),
}

/// Status LEDs, best effort.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Led {
    Usr,
    Rx,
    Tx,
}

/// Transceiver and timing contract.
///
/// The blocking strobe methods mirror the retune protocol: callers strobe
/// the synthesizer off, wait for unlock, program the frequency, strobe it
/// back on, wait for lock, then start RX or TX. Implementations may spin.
pub trait Radio {
    /// Stop RX/TX and the frequency synthesizer.
    fn strobe_off(&mut self);
    /// Block until the synthesizer reports unlocked.
    fn wait_unlock(&mut self);
    /// Program the channel center frequency in MHz.
    fn set_frequency(&mut self, mhz: u16);
    /// The currently programmed frequency in MHz.
    fn frequency(&self) -> u16;
    /// Start the frequency synthesizer.
    fn strobe_fs_on(&mut self);
    /// Block until the synthesizer reports locked.
    fn wait_lock(&mut self);
    fn strobe_rx(&mut self);
    fn strobe_tx(&mut self);

    /// Program the carrier-sense comparator threshold, in dBm.
    fn set_cs_threshold(&mut self, dbm: i8);
    /// Program the sync-word correlator.
    fn set_sync_word(&mut self, sync: u32);
    /// Configure un-synced symbol RX (the promiscuous bitstream path).
    fn configure_rx(&mut self, modulation: Modulation);
    /// Configure sync-word-gated RX.
    fn configure_rx_sync(&mut self, modulation: Modulation, sync: u32);
    /// Begin filling capture windows; completions arrive as events.
    fn start_capture(&mut self);
    /// Copy the completed capture window out of the transfer engine.
    fn read_capture(&mut self, buf: &mut [u8; BUF_LEN]);

    /// Instantaneous RSSI in front-end register units.
    fn rssi(&mut self) -> i8;

    /// Transmit a fully encoded over-the-air buffer.
    fn transmit(&mut self, data: &[u8]);
    /// Emit interference on the current channel.
    fn jam(&mut self);

    fn delay_ms(&mut self, ms: u32);

    /// Drain one pending event.
    fn poll_event(&mut self) -> HwEvent;

    /// Classic basic-rate hop selection for the current tick. Devices
    /// without a classic hop engine sit on the default channel.
    fn classic_next_hop(&mut self, _clkn: u32) -> u16 {
        2441
    }

    fn set_led(&mut self, _led: Led, _on: bool) {}

    fn led(&mut self, _led: Led) -> bool {
        false
    }

    /// Front-end register access for the host's register commands.
    fn read_register(&mut self, _addr: u8) -> u16 {
        0
    }

    fn write_register(&mut self, _addr: u8, _value: u16) {}

    // Hardware self-test modes. Parts without them just sit in the mode
    // until the host asks for something else.
    fn tx_test(&mut self) {}
    fn range_test(&mut self) {}
    fn repeater(&mut self) {}

    fn part_number(&mut self) -> u32 {
        0
    }

    fn serial_number(&mut self) -> [u8; 16] {
        [0; 16]
    }

    /// Full device reset, optionally into the bootloader.
    fn reset_device(&mut self, bootloader: bool);
}
