//! Double-buffered symbol capture.
//!
//! The radio fills the active buffer one 50-byte window at a time; on
//! transfer completion the buffers flip and the completed one becomes the
//! idle buffer the mode loops read from. Timestamp and channel are latched
//! at the flip so the record describes the window, not the moment it was
//! finally drained.

/// Bytes per capture window (400 symbols at one bit per symbol).
pub const BUF_LEN: usize = 50;

/// Unpacked symbol window: two capture windows, one byte per symbol, so
/// packets straddling a window boundary stay decodable.
pub const SYMBOLS_LEN: usize = BUF_LEN * 8 * 2;

pub struct CaptureBuffers {
    bufs: [[u8; BUF_LEN]; 2],
    active: usize,
    // Latched at the last flip.
    pub channel: u16,
    pub clkn_high: u8,
    pub clk100ns: u32,
}

impl CaptureBuffers {
    pub const fn new() -> CaptureBuffers {
        CaptureBuffers {
            bufs: [[0; BUF_LEN]; 2],
            active: 0,
            channel: 0,
            clkn_high: 0,
            clk100ns: 0,
        }
    }

    pub fn active_mut(&mut self) -> &mut [u8; BUF_LEN] {
        &mut self.bufs[self.active]
    }

    /// The last completed window.
    pub fn idle(&self) -> &[u8; BUF_LEN] {
        &self.bufs[1 - self.active]
    }

    /// Flip buffers on transfer completion and latch the window metadata.
    pub fn swap(&mut self, channel: u16, clkn_high: u8, clk100ns: u32) {
        self.active = 1 - self.active;
        self.channel = channel;
        self.clkn_high = clkn_high;
        self.clk100ns = clk100ns;
    }

    pub fn reset(&mut self) {
        self.bufs = [[0; BUF_LEN]; 2];
        self.active = 0;
        self.channel = 0;
        self.clkn_high = 0;
        self.clk100ns = 0;
    }
}
