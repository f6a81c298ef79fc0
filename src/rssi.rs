//! Per-window RSSI statistics and the slow per-channel average.
//!
//! Each capture window accumulates min/max/sum; at window end the average
//! feeds a per-channel IIR (alpha = 1/8, kept in 8.8 fixed point) that the
//! squelch and the AFH prober read as a longer-term noise floor.

/// 2402..=2480 MHz, one slot per MHz.
const CHANNELS: usize = 79;

pub struct Rssi {
    min: i8,
    max: i8,
    sum: i32,
    count: u16,
    iir: [i16; CHANNELS],
}

impl Rssi {
    pub const fn new() -> Rssi {
        Rssi {
            min: i8::MAX,
            max: i8::MIN,
            sum: 0,
            count: 0,
            iir: [0; CHANNELS],
        }
    }

    /// Start a new capture window.
    pub fn reset_window(&mut self) {
        self.min = i8::MAX;
        self.max = i8::MIN;
        self.sum = 0;
        self.count = 0;
    }

    pub fn add(&mut self, sample: i8) {
        if sample < self.min {
            self.min = sample;
        }
        if sample > self.max {
            self.max = sample;
        }
        self.sum += sample as i32;
        self.count = self.count.saturating_add(1);
    }

    pub fn min(&self) -> i8 {
        self.min
    }

    pub fn max(&self) -> i8 {
        self.max
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn avg(&self) -> i8 {
        if self.count == 0 {
            0
        } else {
            (self.sum / self.count as i32) as i8
        }
    }

    /// Fold this window's average into the channel's IIR.
    pub fn iir_update(&mut self, channel: u16) {
        let i = match (channel as usize).checked_sub(2402) {
            Some(i) if i < CHANNELS => i,
            _ => return,
        };
        let avg = (self.avg() as i16) << 8;
        if self.iir[i] == 0 {
            self.iir[i] = avg;
        } else {
            let delta = avg - self.iir[i];
            self.iir[i] += (delta + 4) >> 3;
        }
    }

    /// Long-term average for a channel, in dB (front-end units).
    pub fn iir_level(&self, channel: u16) -> i8 {
        match (channel as usize).checked_sub(2402) {
            Some(i) if i < CHANNELS => (self.iir[i] >> 8) as i8,
            _ => 0,
        }
    }

    pub fn iir_reset(&mut self) {
        self.iir = [0; CHANNELS];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_stats() {
        let mut r = Rssi::new();
        r.reset_window();
        for s in [-60i8, -55, -70, -65] {
            r.add(s);
        }
        assert_eq!(r.min(), -70);
        assert_eq!(r.max(), -55);
        assert_eq!(r.avg(), -62);
        assert_eq!(r.count(), 4);
    }

    #[test]
    fn iir_converges_toward_the_window_average() {
        let mut r = Rssi::new();
        r.reset_window();
        r.add(-40);
        r.iir_update(2410);
        // First update seeds directly.
        assert_eq!(r.iir_level(2410), -40);

        // Feed a quieter level repeatedly; the IIR walks toward it.
        for _ in 0..64 {
            r.reset_window();
            r.add(-80);
            r.iir_update(2410);
        }
        let level = r.iir_level(2410);
        assert!(level <= -78, "iir stuck at {}", level);
        // Other channels untouched.
        assert_eq!(r.iir_level(2412), 0);
    }

    #[test]
    fn out_of_band_channels_are_ignored(){
        let mut r = Rssi::new();
        r.reset_window();
        r.add(-50);
        r.iir_update(2401);
        r.iir_update(2481);
        assert_eq!(r.iir_level(2401), 0);
        assert_eq!(r.iir_level(2481), 0);
    }
}
