//! nRF52840 radio and timer shim.
//!
//! Maps the [`Radio`] contract onto the chip's RADIO peripheral and TIMER2.
//! The engine does its own dewhitening and CRC work, so the radio is run as
//! raw as the chip allows: hardware whitening and CRC stay off, and capture
//! windows are fixed-length reads of whatever was on the air.
//!
//! Interrupt handlers only latch events into the struct; the engine drains
//! them through `poll_event` from thread context.

use core::sync::atomic::{compiler_fence, Ordering::SeqCst};

use embedded_hal::digital::v2::{OutputPin, StatefulOutputPin};
use hal::gpio::{Output, Pin, PushPull};
use hal::pac::{RADIO, TIMER2};
use nrf52840_hal as hal;
use rtt_target::rprintln;

use crate::capture::BUF_LEN;
use crate::hardware::{HwEvent, Led, Radio};
use crate::{Mode, Modulation};

/// Sync-gated capture length: up to 48 PDU bytes, the access address is
/// stripped by the address match.
const SYNC_CAPTURE_LEN: u8 = 48;

pub struct Nrf52840Radio {
    radio: RADIO,
    timer: TIMER2,
    /// DMA target; the END handler copies it out before re-arming.
    receive_buffer: [u8; BUF_LEN],
    capture: [u8; BUF_LEN],
    send_buffer: [u8; BUF_LEN + 4],
    frequency: u16,
    cs_threshold: i8,
    leds: Option<[Pin<Output<PushPull>>; 3]>,

    // Latched by the interrupt handlers, drained by poll_event.
    pending_ticks: u16,
    pending_transfer: bool,
    pending_error: bool,
    pending_cs: bool,
    pending_request: Option<Mode>,
}

impl Nrf52840Radio {
    /// Takes ownership of the RADIO and TIMER2 peripherals. `leds` are
    /// Usr/Rx/Tx in that order, or None on boards without them.
    pub fn new(
        radio: RADIO,
        timer: TIMER2,
        leds: Option<[Pin<Output<PushPull>>; 3]>,
    ) -> Nrf52840Radio {
        let mut this = Nrf52840Radio {
            radio,
            timer,
            receive_buffer: [0; BUF_LEN],
            capture: [0; BUF_LEN],
            send_buffer: [0; BUF_LEN + 4],
            frequency: 0,
            cs_threshold: 0,
            leds,
            pending_ticks: 0,
            pending_transfer: false,
            pending_error: false,
            pending_cs: false,
            pending_request: None,
        };
        this.start_clock();
        this
    }

    /// TIMER2 as the 3200 Hz native clock: at a 2 MHz timer rate the
    /// 312.5 us tick is an integral 625 counts.
    fn start_clock(&mut self) {
        let timer = &mut self.timer;

        compiler_fence(SeqCst);

        timer.tasks_stop.write(|w| w.tasks_stop().set_bit());
        timer.tasks_clear.write(|w| w.tasks_clear().set_bit());
        timer.mode.write(|w| w.mode().timer());
        timer.bitmode.write(|w| w.bitmode()._32bit());
        // f_tick = 16 MHz / 2^prescaler = 2 MHz.
        timer.prescaler.write(|w| unsafe { w.prescaler().bits(3) });
        timer.cc[0].write(|w| unsafe { w.cc().bits(625) });
        // Auto-clear on compare so the period is exact.
        timer.shorts.write(|w| w.compare0_clear().enabled());
        timer.events_compare[0].reset();
        timer.intenset.modify(|_, w| w.compare0().set());
        timer.tasks_start.write(|w| w.tasks_start().set_bit());

        compiler_fence(SeqCst);
    }

    /// Call from the TIMER2 interrupt.
    pub fn timer_interrupt(&mut self) {
        compiler_fence(SeqCst);
        if self.timer.events_compare[0].read().bits() != 0 {
            self.timer.events_compare[0].reset();
            self.pending_ticks = self.pending_ticks.saturating_add(1);
        }
        compiler_fence(SeqCst);
    }

    /// Call from the RADIO interrupt.
    pub fn radio_interrupt(&mut self) {
        compiler_fence(SeqCst);
        let radio = &self.radio;

        // Address match doubles as the carrier-sense trigger; the short
        // started an RSSI sample at the same moment.
        if radio.events_address.read().bits() != 0 {
            radio.events_address.reset();
            self.pending_cs = true;
        }

        if radio.events_end.read().bits() != 0 {
            radio.events_end.reset();
            if self.pending_transfer {
                // Engine fell behind; it accounts the overwrite itself.
                rprintln!("capture overrun");
            }
            self.capture = self.receive_buffer;
            self.pending_transfer = true;
        }
        compiler_fence(SeqCst);
    }

    /// Hand a decoded host request to the engine.
    pub fn host_request(&mut self, mode: Mode) {
        self.pending_request = Some(mode);
    }

    fn set_mode_register(&mut self, modulation: Modulation) {
        match modulation {
            // Classic basic rate is plain 1 Mbit GFSK; BLE_1MBIT has the
            // same modulation, so one register value covers both.
            Modulation::BasicRate => self.radio.mode.write(|w| w.mode().nrf_1mbit()),
            Modulation::LowEnergy => self.radio.mode.write(|w| w.mode().ble_1mbit()),
        }
    }
}

impl Radio for Nrf52840Radio {
    fn strobe_off(&mut self) {
        compiler_fence(SeqCst);
        self.radio.events_disabled.reset();
        self.radio.tasks_disable.write(|w| w.tasks_disable().set_bit());
        compiler_fence(SeqCst);
    }

    fn wait_unlock(&mut self) {
        while !self.radio.state.read().state().is_disabled() {}
    }

    fn set_frequency(&mut self, mhz: u16) {
        self.frequency = mhz;
        let offset = (mhz.saturating_sub(2400)) as u8;
        self.radio
            .frequency
            .write(|w| unsafe { w.frequency().bits(offset) });
    }

    fn frequency(&self) -> u16 {
        self.frequency
    }

    fn strobe_fs_on(&mut self) {
        // The synthesizer ramps with RXEN/TXEN on this chip; nothing to do
        // until the final strobe.
    }

    fn wait_lock(&mut self) {}

    fn strobe_rx(&mut self) {
        compiler_fence(SeqCst);
        self.radio.events_ready.reset();
        self.radio
            .shorts
            .write(|w| w.rxready_start().enabled().address_rssistart().enabled());
        self.radio.tasks_rxen.write(|w| w.tasks_rxen().set_bit());
        compiler_fence(SeqCst);
    }

    fn strobe_tx(&mut self) {
        compiler_fence(SeqCst);
        self.radio.events_ready.reset();
        self.radio.shorts.write(|w| w.txready_start().enabled());
        self.radio.tasks_txen.write(|w| w.tasks_txen().set_bit());
        compiler_fence(SeqCst);
    }

    fn set_cs_threshold(&mut self, dbm: i8) {
        // No hardware comparator; the squelch arithmetic runs on sampled
        // RSSI in the engine. Kept for the register read-back commands.
        self.cs_threshold = dbm;
    }

    fn set_sync_word(&mut self, sync: u32) {
        let radio = &mut self.radio;
        radio.base0.write(|w| unsafe { w.bits(sync << 8) });
        radio
            .prefix0
            .write(|w| unsafe { w.ap0().bits((sync >> 24) as u8) });
    }

    /// Unsynced bitstream capture: match on the 0xAA preamble pattern so
    /// the receiver starts on any traffic, fixed-length windows, hardware
    /// whitening and CRC off.
    fn configure_rx(&mut self, modulation: Modulation) {
        self.set_mode_register(modulation);
        let radio = &mut self.radio;

        radio.rxaddresses.write(|w| w.addr0().enabled());
        radio.base0.write(|w| unsafe { w.bits(0) });
        radio.prefix0.write(|w| unsafe { w.ap0().bits(0xAA) });

        // No length fields on the air: statlen pins the window size.
        radio.pcnf0.write(|w| unsafe { w.lflen().bits(0).s0len().bit(false).s1len().bits(0) });
        radio.pcnf1.write(|w| unsafe {
            w.maxlen()
                .bits(BUF_LEN as u8)
                .statlen()
                .bits(BUF_LEN as u8)
                .balen()
                .bits(1)
        });
        radio.crccnf.write(|w| w.len().disabled());

        radio.events_end.reset();
        radio.intenset.write(|w| w.end().set().address().set());
    }

    /// Sync-word-gated capture: full access address match, PDU bytes raw.
    fn configure_rx_sync(&mut self, modulation: Modulation, sync: u32) {
        self.set_mode_register(modulation);
        let radio = &mut self.radio;

        radio.rxaddresses.write(|w| w.addr0().enabled());
        radio.pcnf0.write(|w| unsafe { w.lflen().bits(0).s0len().bit(false).s1len().bits(0) });
        radio.pcnf1.write(|w| unsafe {
            w.maxlen()
                .bits(SYNC_CAPTURE_LEN)
                .statlen()
                .bits(SYNC_CAPTURE_LEN)
                .balen()
                .bits(3)
        });
        radio.crccnf.write(|w| w.len().disabled());

        radio.events_end.reset();
        radio.intenset.write(|w| w.end().set().address().set());
        self.set_sync_word(sync);
    }

    fn start_capture(&mut self) {
        compiler_fence(SeqCst);
        let ptr = self.receive_buffer.as_ptr() as u32;
        self.radio
            .packetptr
            .write(|w| unsafe { w.packetptr().bits(ptr) });
        self.radio.events_end.reset();
        if self.radio.state.read().state().is_rx_idle() {
            self.radio.tasks_start.write(|w| w.tasks_start().set_bit());
        }
        compiler_fence(SeqCst);
    }

    fn read_capture(&mut self, buf: &mut [u8; BUF_LEN]) {
        *buf = self.capture;
    }

    fn rssi(&mut self) -> i8 {
        compiler_fence(SeqCst);
        self.radio
            .tasks_rssistart
            .write(|w| w.tasks_rssistart().set_bit());
        // Completes within 0.25 us; one read-back covers it.
        while self.radio.events_rssiend.read().bits() == 0 {}
        self.radio.events_rssiend.reset();
        // RSSISAMPLE holds the magnitude; the level is its negation.
        -((self.radio.rssisample.read().bits() as u8) as i8)
    }

    fn transmit(&mut self, data: &[u8]) {
        let len = data.len().min(self.send_buffer.len());
        self.send_buffer[..len].copy_from_slice(&data[..len]);

        compiler_fence(SeqCst);
        let radio = &mut self.radio;
        radio.pcnf1.modify(|_, w| unsafe {
            w.maxlen().bits(len as u8).statlen().bits(len as u8)
        });
        let ptr = self.send_buffer.as_ptr() as u32;
        radio.packetptr.write(|w| unsafe { w.packetptr().bits(ptr) });
        radio.events_end.reset();
        radio.tasks_start.write(|w| w.tasks_start().set_bit());
        while radio.events_end.read().bits() == 0 {}
        radio.events_end.reset();
        compiler_fence(SeqCst);
    }

    fn jam(&mut self) {
        // A burst of alternating symbols on the current channel is enough
        // to corrupt any overlapping packet's CRC.
        let burst = [0x55u8; 16];
        self.transmit(&burst);
    }

    fn delay_ms(&mut self, ms: u32) {
        // 64 MHz core clock.
        cortex_m::asm::delay(64_000 * ms);
    }

    fn poll_event(&mut self) -> HwEvent {
        if self.pending_error {
            self.pending_error = false;
            return HwEvent::TransferError;
        }
        if self.pending_transfer {
            self.pending_transfer = false;
            return HwEvent::TransferComplete;
        }
        if self.pending_cs {
            self.pending_cs = false;
            return HwEvent::CsTrigger;
        }
        if self.pending_ticks > 0 {
            self.pending_ticks -= 1;
            return HwEvent::TimerTick;
        }
        if let Some(mode) = self.pending_request.take() {
            return HwEvent::HostRequest(mode);
        }
        HwEvent::Idle
    }

    fn set_led(&mut self, led: Led, on: bool) {
        if let Some(leds) = self.leds.as_mut() {
            let pin = &mut leds[led as usize];
            if on {
                pin.set_high().ok();
            } else {
                pin.set_low().ok();
            }
        }
    }

    fn led(&mut self, led: Led) -> bool {
        match self.leds.as_ref() {
            Some(leds) => leds[led as usize].is_set_high().unwrap_or(false),
            None => false,
        }
    }

    fn read_register(&mut self, addr: u8) -> u16 {
        // A small virtual register file for the host's debug commands.
        match addr {
            0x00 => self.frequency,
            0x01 => self.cs_threshold as u8 as u16,
            0x02 => self.radio.state.read().bits() as u16,
            _ => 0,
        }
    }

    fn part_number(&mut self) -> u32 {
        let ficr = unsafe { &*hal::pac::FICR::ptr() };
        ficr.info.part.read().bits()
    }

    fn serial_number(&mut self) -> [u8; 16] {
        let ficr = unsafe { &*hal::pac::FICR::ptr() };
        let mut serial = [0u8; 16];
        serial[0..4].copy_from_slice(&ficr.deviceid[0].read().bits().to_le_bytes());
        serial[4..8].copy_from_slice(&ficr.deviceid[1].read().bits().to_le_bytes());
        serial
    }

    fn reset_device(&mut self, bootloader: bool) {
        if bootloader {
            rprintln!("reset to bootloader requested");
            // GPREGRET conventionally tells the bootloader to stay; the
            // board's bootloader defines the magic value.
            let power = unsafe { &*hal::pac::POWER::ptr() };
            power.gpregret.write(|w| unsafe { w.gpregret().bits(0xb1) });
        }
        cortex_m::peripheral::SCB::sys_reset();
    }
}
