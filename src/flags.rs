//! Handoff cells between radio event context and the mode loops.
//!
//! Radio and timer events only touch these cells (and the capture buffers);
//! all protocol work happens in the mode loops, which poll them. Every cell
//! is independent, so plain atomic loads and stores are enough; the one
//! ordering that matters is capture-buffer contents before the transfer
//! count, hence the Release/Acquire pair on that counter.

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};

use crate::Mode;

pub struct Flags {
    hop_due: AtomicBool,
    cs_trigger: AtomicBool,
    transfers: AtomicU8,
    transfer_errors: AtomicU8,
    discard_next: AtomicBool,
    requested_mode: AtomicU8,
    requested_channel: AtomicU16,
}

impl Flags {
    pub const fn new() -> Flags {
        Flags {
            hop_due: AtomicBool::new(false),
            cs_trigger: AtomicBool::new(false),
            transfers: AtomicU8::new(0),
            transfer_errors: AtomicU8::new(0),
            discard_next: AtomicBool::new(false),
            requested_mode: AtomicU8::new(Mode::Idle as u8),
            requested_channel: AtomicU16::new(0),
        }
    }

    // -- hop timing --------------------------------------------------------

    pub fn signal_hop(&self) {
        self.hop_due.store(true, Ordering::Relaxed);
    }

    pub fn hop_pending(&self) -> bool {
        self.hop_due.load(Ordering::Relaxed)
    }

    /// Cleared by the retune sequence itself, first thing.
    pub fn clear_hop(&self) {
        self.hop_due.store(false, Ordering::Relaxed);
    }

    // -- carrier sense -----------------------------------------------------

    pub fn signal_cs(&self) {
        self.cs_trigger.store(true, Ordering::Relaxed);
    }

    pub fn cs_pending(&self) -> bool {
        self.cs_trigger.load(Ordering::Relaxed)
    }

    pub fn clear_cs(&self) {
        self.cs_trigger.store(false, Ordering::Relaxed);
    }

    // -- capture transfers -------------------------------------------------

    /// One capture window completed. Called after the buffer swap.
    pub fn note_transfer(&self) {
        self.transfers.fetch_add(1, Ordering::Release);
    }

    pub fn transfers_pending(&self) -> u8 {
        self.transfers.load(Ordering::Acquire)
    }

    /// Collect and clear the completion count. A value above one means the
    /// consumer fell behind and a buffer was overwritten.
    pub fn take_transfers(&self) -> u8 {
        self.transfers.swap(0, Ordering::Acquire)
    }

    pub fn note_transfer_error(&self) {
        self.transfer_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_errors_pending(&self) -> u8 {
        self.transfer_errors.load(Ordering::Relaxed)
    }

    pub fn take_transfer_errors(&self) -> u8 {
        self.transfer_errors.swap(0, Ordering::Relaxed)
    }

    /// The first window after a retune holds stale symbols; mark it.
    pub fn set_discard(&self) {
        self.discard_next.store(true, Ordering::Relaxed);
    }

    pub fn take_discard(&self) -> bool {
        self.discard_next.swap(false, Ordering::Relaxed)
    }

    // -- host requests -----------------------------------------------------

    pub fn request_mode(&self, mode: Mode) {
        self.requested_mode.store(mode as u8, Ordering::Relaxed);
    }

    pub fn requested_mode(&self) -> Mode {
        Mode::from_u8(self.requested_mode.load(Ordering::Relaxed))
    }

    /// Channel retune request for the sync loop; zero means none pending.
    pub fn request_channel(&self, channel: u16) {
        self.requested_channel.store(channel, Ordering::Relaxed);
    }

    pub fn take_channel_request(&self) -> Option<u16> {
        match self.requested_channel.swap(0, Ordering::Relaxed) {
            0 => None,
            c => Some(c),
        }
    }

    pub fn channel_request_pending(&self) -> bool {
        self.requested_channel.load(Ordering::Relaxed) != 0
    }
}
