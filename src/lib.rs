//! Bluetooth BR/BTLE radio-protocol tracking engine.
//!
//! A portable firmware core for a 2.4 GHz packet sniffer: it tunes a raw
//! transceiver across the band, captures symbol windows, recovers BTLE
//! connection parameters (access address, CRC init, hop interval, hop
//! increment) with or without a captured CONNECT_REQ, follows the hop
//! sequence of a live connection, and streams capture records to a host.
//!
//! The engine is hardware-agnostic behind the [`hardware::Radio`] trait;
//! the `nrf52840` feature supplies a chip shim. Everything else is `no_std`
//! with static storage only.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod capture;
pub mod clock;
pub mod codec;
pub mod command;
pub mod flags;
pub mod hardware;
pub mod hop;
pub mod link;
pub mod promisc;
pub mod queue;
pub mod rssi;
pub mod squelch;
pub mod stream;

#[cfg(feature = "nrf52840")]
pub mod nrf52840;

use capture::{CaptureBuffers, SYMBOLS_LEN};
use clock::Clock;
use flags::Flags;
use hardware::{HwEvent, Led, Radio};
use hop::HopSchedule;
use link::{LeLink, LinkPhase};
use promisc::{PacketHandler, PromiscState, SymbolHandler};
use queue::{OutputQueue, RecordKind};
use rssi::Rssi;
use squelch::Squelch;
use stream::Exit;

/// Engine operating mode. Host commands request one; the running mode loop
/// notices and unwinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Mode {
    Idle = 0,
    Reset = 1,
    /// Raw basic-rate (or LE) symbol streaming.
    RxSymbols = 2,
    TxSymbols = 3,
    /// Classic hop-along capture.
    BtFollow = 4,
    /// Sync-word-gated LE capture and connection following.
    BtFollowLe = 5,
    /// Connection-parameter recovery without a CONNECT_REQ.
    BtPromiscLe = 6,
    /// Advertise as an LE slave.
    BtSlaveLe = 7,
    Specan = 8,
    LedSpecan = 9,
    TxTest = 10,
    RangeTest = 11,
    Repeater = 12,
    Ego = 13,
    /// AFH channel-map probing.
    Afh = 14,
}

impl Mode {
    pub fn from_u8(raw: u8) -> Mode {
        match raw {
            1 => Mode::Reset,
            2 => Mode::RxSymbols,
            3 => Mode::TxSymbols,
            4 => Mode::BtFollow,
            5 => Mode::BtFollowLe,
            6 => Mode::BtPromiscLe,
            7 => Mode::BtSlaveLe,
            8 => Mode::Specan,
            9 => Mode::LedSpecan,
            10 => Mode::TxTest,
            11 => Mode::RangeTest,
            12 => Mode::Repeater,
            13 => Mode::Ego,
            14 => Mode::Afh,
            _ => Mode::Idle,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Modulation {
    BasicRate = 0,
    LowEnergy = 1,
}

/// Packets transmitted per jam burst once armed.
pub const JAM_COUNT_DEFAULT: u16 = 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum JamMode {
    None,
    /// Jam one burst, then drop to idle.
    Once,
    /// Jam every connection until told otherwise.
    Continuous,
}

/// Jam burst state: armed when a followed connection establishes, counted
/// down one interference packet per connection event.
#[derive(Clone, Copy, Debug)]
pub struct Jam {
    pub mode: JamMode,
    pub count: u16,
}

impl Jam {
    pub const fn new() -> Jam {
        Jam {
            mode: JamMode::None,
            count: 0,
        }
    }

    /// Start a burst if a jam mode is configured.
    pub fn arm(&mut self) {
        if self.mode != JamMode::None {
            self.count = JAM_COUNT_DEFAULT;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EgoMode {
    Follow,
    ContinuousRx,
    Jam,
}

pub const SPECAN_LOW_DEFAULT: u16 = 2400;
pub const SPECAN_HIGH_DEFAULT: u16 = 2483;

/// All engine state. One instance lives for the whole firmware run; the
/// mode loops and the command dispatcher share it.
pub struct Context {
    pub flags: Flags,
    pub clock: Clock,
    /// The mode currently holding the radio (`flags` carries the requested
    /// one).
    pub mode: Mode,
    pub modulation: Modulation,
    /// Pending status bits for the next output record.
    pub status: u8,
    pub link: LeLink,
    pub hop: HopSchedule,
    pub promisc: PromiscState,
    pub packet_handler: Option<PacketHandler>,
    pub symbol_handler: Option<SymbolHandler>,
    pub queue: OutputQueue,
    pub buffers: CaptureBuffers,
    /// Unpacked one-byte-per-symbol history, two capture windows deep.
    pub symbols: [u8; SYMBOLS_LEN],
    pub rssi: Rssi,
    pub squelch: Squelch,
    pub jam: Jam,
    /// Classic target address, stored for the classic follower shim.
    pub classic_target: [u8; 6],
    /// Advertised address for slave mode.
    pub slave_mac: [u8; 6],
    pub specan_low: u16,
    pub specan_high: u16,
    /// LED spectrum display threshold, dBm.
    pub rssi_threshold: i8,
    pub ego_mode: EgoMode,
}

impl Context {
    pub fn new() -> Context {
        Context {
            flags: Flags::new(),
            clock: Clock::new(),
            mode: Mode::Idle,
            modulation: Modulation::BasicRate,
            status: 0,
            link: LeLink::default(),
            hop: HopSchedule::default(),
            promisc: PromiscState::new(),
            packet_handler: None,
            symbol_handler: None,
            queue: OutputQueue::new(),
            buffers: CaptureBuffers::new(),
            symbols: [0; SYMBOLS_LEN],
            rssi: Rssi::new(),
            squelch: Squelch::new(),
            jam: Jam::new(),
            classic_target: [0; 6],
            slave_mac: [0; 6],
            specan_low: SPECAN_LOW_DEFAULT,
            specan_high: SPECAN_HIGH_DEFAULT,
            rssi_threshold: -30,
            ego_mode: EgoMode::Follow,
        }
    }
}

impl Default for Context {
    fn default() -> Context {
        Context::new()
    }
}

/// Quiesce the radio and put the engine state back to its resting shape.
/// Host-owned configuration survives: the AFH map, targets kept by their
/// own reset rules, the output queue (the host still drains it), and the
/// requested-mode cell.
fn idle_reset<R: Radio>(radio: &mut R, ctx: &mut Context) {
    radio.strobe_off();
    radio.set_led(Led::Rx, false);
    radio.set_led(Led::Tx, false);
    ctx.hop.reset();
    ctx.buffers.reset();
    ctx.symbols = [0; SYMBOLS_LEN];
    ctx.status = 0;
    ctx.modulation = Modulation::BasicRate;
    ctx.link.reset();
    ctx.link.phase = LinkPhase::Inactive;
    ctx.promisc.reset();
    ctx.packet_handler = None;
    ctx.symbol_handler = None;
    ctx.squelch.reset();
    ctx.jam = Jam::new();
    ctx.specan_low = SPECAN_LOW_DEFAULT;
    ctx.specan_high = SPECAN_HIGH_DEFAULT;
    ctx.classic_target = [0; 6];
}

/// The engine proper: owns the radio and the context, and runs whichever
/// mode the host last requested until the event source runs dry.
pub struct Tracker<R: Radio> {
    pub radio: R,
    pub ctx: Context,
}

impl<R: Radio> Tracker<R> {
    pub fn new(radio: R) -> Tracker<R> {
        Tracker {
            radio,
            ctx: Context::new(),
        }
    }

    /// Dispatch mode loops until the radio reports no pending events (the
    /// embedding then sleeps and calls again). Mode switches requested by
    /// the host or by the loops themselves are taken here.
    pub fn poll(&mut self) {
        loop {
            let next = self.ctx.flags.requested_mode();
            if next != self.ctx.mode {
                info!("mode change: {} -> {}", self.ctx.mode as u8, next as u8);
                self.ctx.mode = next;
                if next == Mode::Idle {
                    idle_reset(&mut self.radio, &mut self.ctx);
                }
            }

            let exit = match self.ctx.mode {
                Mode::Idle => self.sit(),
                Mode::Reset => {
                    // Grace period so the command response gets out first.
                    self.radio.delay_ms(100);
                    self.radio.reset_device(false);
                    return;
                }
                Mode::RxSymbols => match self.ctx.modulation {
                    Modulation::BasicRate => stream::stream_rx_loop(
                        &mut self.radio,
                        &mut self.ctx,
                        RecordKind::BrPacket,
                    ),
                    Modulation::LowEnergy => {
                        self.ctx.symbol_handler = Some(SymbolHandler::FollowLe);
                        self.ctx.packet_handler = Some(PacketHandler::ConnectionFollow);
                        stream::bt_generic_le(&mut self.radio, &mut self.ctx)
                    }
                },
                Mode::TxSymbols => stream::br_transmit(&mut self.radio, &mut self.ctx),
                Mode::BtFollow | Mode::Afh => {
                    stream::stream_rx_loop(&mut self.radio, &mut self.ctx, RecordKind::BrPacket)
                }
                Mode::BtFollowLe => {
                    self.ctx.packet_handler = Some(PacketHandler::ConnectionFollow);
                    self.ctx.symbol_handler = None;
                    stream::bt_le_sync(&mut self.radio, &mut self.ctx)
                }
                Mode::BtPromiscLe => stream::bt_promisc_le(&mut self.radio, &mut self.ctx),
                Mode::BtSlaveLe => stream::bt_slave_le(&mut self.radio, &mut self.ctx),
                Mode::Specan => stream::specan(&mut self.radio, &mut self.ctx),
                Mode::LedSpecan => stream::led_specan(&mut self.radio, &mut self.ctx),
                Mode::TxTest => {
                    self.radio.tx_test();
                    self.sit()
                }
                Mode::RangeTest => {
                    self.radio.range_test();
                    self.sit()
                }
                Mode::Repeater => {
                    self.radio.repeater();
                    self.sit()
                }
                Mode::Ego => stream::ego(&mut self.radio, &mut self.ctx),
            };

            match exit {
                Exit::Exhausted => return,
                // A mode switch loops back around; an internal handoff
                // re-enters the same mode.
                Exit::ModeChange | Exit::Handoff => {}
            }
        }
    }

    /// Keep the clock and flags serviced while nothing radio-side runs.
    fn sit(&mut self) -> Exit {
        let my_mode = self.ctx.mode;
        loop {
            if self.ctx.flags.requested_mode() != my_mode {
                return Exit::ModeChange;
            }
            if stream::pump(&mut self.radio, &mut self.ctx) == HwEvent::Idle {
                return Exit::Exhausted;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::BUF_LEN;
    use crate::codec::{crc24, rbit24, Whitener};
    use crate::hardware::mock::{MockRadio, Op, Step};
    use crate::hop::HopMode;
    use crate::queue::STATUS_FIFO_OVERFLOW;

    /// Capture-window bytes for an LE packet: raw access address, then the
    /// whitened PDU, every byte bit-reversed into capture order. The tail
    /// stays zero (provably inert for the header scan).
    fn le_window(channel: u16, aa: u32, pdu: &[u8]) -> [u8; BUF_LEN] {
        let mut w = [0u8; BUF_LEN];
        let mut wh = Whitener::for_channel(channel);
        for (i, b) in aa.to_le_bytes().iter().enumerate() {
            w[i] = b.reverse_bits();
        }
        for (i, &b) in pdu.iter().enumerate() {
            w[4 + i] = wh.apply_byte(b).reverse_bits();
        }
        w
    }

    /// Sync-gated window: the radio strips the access address, so the
    /// window starts at the whitened PDU.
    fn sync_window(channel: u16, pdu: &[u8]) -> [u8; BUF_LEN] {
        let mut w = [0u8; BUF_LEN];
        let mut wh = Whitener::for_channel(channel);
        for (i, &b) in pdu.iter().enumerate() {
            w[i] = wh.apply_byte(b).reverse_bits();
        }
        w
    }

    fn empty_pdu_with_crc(seed_rev: u32) -> [u8; 5] {
        let pdu = [0x01u8, 0x00];
        let crc = crc24(seed_rev, &pdu);
        [pdu[0], pdu[1], crc as u8, (crc >> 8) as u8, (crc >> 16) as u8]
    }

    #[test]
    fn mode_round_trips_and_defaults_to_idle() {
        for raw in 0..15u8 {
            assert_eq!(Mode::from_u8(raw) as u8, raw);
        }
        assert_eq!(Mode::from_u8(200), Mode::Idle);
    }

    #[test]
    fn idle_reset_keeps_host_owned_state() {
        let mut radio = MockRadio::new(vec![]);
        let mut ctx = Context::new();
        let mut map = [0u8; 10];
        map[0] = 0x0f;
        ctx.hop.set_afh_map(map);
        ctx.link.set_target([0xab; 6]);
        ctx.link.phase = LinkPhase::Connected;
        ctx.status = 0xff;
        let mut status = 0u8;
        ctx.queue
            .push(queue::OutputRecord::empty(RecordKind::BrPacket), &mut status);

        idle_reset(&mut radio, &mut ctx);
        assert_eq!(ctx.link.phase, LinkPhase::Inactive);
        assert_eq!(ctx.status, 0);
        assert_eq!(ctx.hop.afh_map(), &map, "afh map is host state");
        assert!(ctx.link.target_set, "target filter is host state");
        assert_eq!(ctx.queue.len(), 1, "queue drains through the host");
        assert!(radio.take_ops().contains(&Op::StrobeOff));
    }

    #[test]
    fn poll_runs_the_requested_mode_and_idles_out() {
        let mut tracker = Tracker::new(MockRadio::new(vec![
            Step::Request(Mode::RxSymbols),
            Step::Transfer([0xaa; BUF_LEN]),
        ]));
        tracker.poll();
        assert_eq!(tracker.ctx.mode, Mode::RxSymbols);
        assert_eq!(tracker.ctx.queue.len(), 1);

        // A later stop request tears the mode down through idle_reset.
        tracker.radio.push_step(Step::Request(Mode::Idle));
        tracker.poll();
        assert_eq!(tracker.ctx.mode, Mode::Idle);
        assert_eq!(tracker.ctx.link.phase, LinkPhase::Inactive);
        // The capture record is still there for the host.
        assert_eq!(tracker.ctx.queue.len(), 1);
    }

    #[test]
    fn reset_mode_bounces_the_device() {
        let mut tracker = Tracker::new(MockRadio::new(vec![]));
        tracker.ctx.flags.request_mode(Mode::Reset);
        tracker.poll();
        assert!(tracker.radio.ops.contains(&Op::ResetDevice(false)));
    }

    #[test]
    fn follow_mode_captures_a_connection_from_connect_req() {
        let channel = 2402;
        let seed_rev = rbit24(link::ADV_CRC_INIT);

        // CONNECT_REQ: AA 0x50554488, CRCInit 0x123456, WinOffset 8,
        // Interval 24, Hop 9, plus a valid advertising CRC.
        let mut pdu = [0u8; 37];
        pdu[0] = 0x05;
        pdu[1] = 34;
        pdu[2..8].copy_from_slice(&[1, 2, 3, 4, 5, 6]); // InitA
        pdu[8..14].copy_from_slice(&[9, 9, 9, 9, 9, 9]); // AdvA
        pdu[14..18].copy_from_slice(&0x5055_4488u32.to_le_bytes());
        pdu[18] = 0x56; // CRCInit, little endian
        pdu[19] = 0x34;
        pdu[20] = 0x12;
        pdu[21] = 2; // WinSize
        pdu[22] = 8; // WinOffset
        pdu[24] = 24; // Interval
        pdu[30] = 9; // Hop
        let crc = crc24(seed_rev, &pdu[..36]);
        let mut wire = [0u8; 39];
        wire[..36].copy_from_slice(&pdu[..36]);
        wire[36] = crc as u8;
        wire[37] = (crc >> 8) as u8;
        wire[38] = (crc >> 16) as u8;

        let mut tracker = Tracker::new(MockRadio::new(vec![
            Step::Transfer([0; BUF_LEN]), // post-retune discard
            Step::Transfer(sync_window(channel, &wire)),
        ]));
        tracker.ctx.hop.channel = channel;
        tracker.ctx.hop.mode = HopMode::Btle;
        tracker.ctx.flags.request_mode(Mode::BtFollowLe);
        tracker.poll();

        let link = &tracker.ctx.link;
        assert_eq!(link.phase, LinkPhase::ConnPending);
        assert_eq!(link.access_address, 0x5055_4488);
        assert_eq!(link.crc_init, 0x12_3456);
        assert_eq!(link.conn_interval, 24);
        assert_eq!(link.channel_increment, 9);
        // The hop flag raised by the accept was consumed by a retune onto
        // the first data channel.
        assert!(!tracker.ctx.flags.hop_pending());
        assert!(tracker
            .radio
            .ops
            .contains(&Op::SetSyncWord(0x5055_4488)));
    }

    /// Full promiscuous discovery: symbol scan promotes an access address,
    /// then CRC init, hop interval and hop increment are recovered in turn
    /// and the link comes up Connected.
    #[test]
    fn promiscuous_discovery_end_to_end() {
        let aa = 0x50aa_33c6u32;
        let crc_init = 0x12_3456u32;
        let seed_rev = rbit24(crc_init);
        let interval = 30u32; // 37.5 ms

        let scan = le_window(2440, aa, &[0x01, 0x00]);
        let p2440 = sync_window(2440, &empty_pdu_with_crc(seed_rev));
        let p2404 = sync_window(2404, &empty_pdu_with_crc(seed_rev));
        let p2406 = sync_window(2406, &empty_pdu_with_crc(seed_rev));

        let mut script = vec![
            Step::Request(Mode::BtPromiscLe),
            // Stage 0: discard window, then three qualified windows carrying
            // the same packet; the repeated sightings promote the address.
            Step::Transfer([0; BUF_LEN]),
            Step::CsTrigger,
            Step::Transfer(scan),
            Step::CsTrigger,
            Step::Transfer(scan),
            Step::CsTrigger,
            Step::Transfer(scan),
            // Stage 1: sync RX on the promoted address; first window after
            // the retune is discarded, the next recovers the CRC init.
            Step::Transfer([0; BUF_LEN]),
            Step::Transfer(p2440),
        ];
        // Stage 2: packets one full map cycle apart on the fixed channel:
        // interval * 37 events, at 4 ticks per 1.25 ms time base.
        for _ in 0..7 {
            script.push(Step::Ticks(interval * 37 * 4));
            script.push(Step::Transfer(p2440));
        }
        // Stage 3: consensus moved us to 2404 (one discarded window), the
        // anchor packet sends us to 2406, and the second sighting sixteen
        // events later pins the increment to 16^-1 mod 37 = 7.
        script.push(Step::Transfer([0; BUF_LEN]));
        script.push(Step::Transfer(p2404));
        script.push(Step::Transfer([0; BUF_LEN]));
        script.push(Step::Ticks(16 * interval * 4));
        script.push(Step::Transfer(p2406));

        let mut tracker = Tracker::new(MockRadio::new(script));
        tracker.poll();

        let link = &tracker.ctx.link;
        assert_eq!(link.phase, LinkPhase::Connected);
        assert_eq!(link.access_address, aa);
        assert_eq!(link.crc_init, crc_init);
        assert_eq!(link.conn_interval, interval as u16);
        assert_eq!(link.channel_increment, 7);
        assert_eq!(link.channel_idx, 8);
        assert_eq!(link.interval_timer, interval as u16 / 2);
        assert!(!link.crc_verify, "follower trusts its own recovery");
        assert_eq!(tracker.ctx.hop.mode, HopMode::Btle);
        assert_eq!(
            tracker.ctx.packet_handler,
            Some(PacketHandler::ConnectionFollow)
        );

        // The queue leads with the stage-0 candidate sightings, then the
        // progress records for stages 0 and 1; the rest of the traffic
        // overflowed the bounded queue, which is reported, not fatal.
        for _ in 0..4 {
            let rec = tracker.ctx.queue.pop().unwrap();
            assert_eq!(rec.kind, RecordKind::LePacket);
            assert_eq!(&rec.data[..4], &aa.to_le_bytes());
        }
        let r0 = tracker.ctx.queue.pop().unwrap();
        assert_eq!(r0.kind, RecordKind::LePromisc);
        assert_eq!(r0.data[0], 0);
        assert_eq!(&r0.data[1..5], &aa.to_le_bytes());
        let r1 = tracker.ctx.queue.pop().unwrap();
        assert_eq!(r1.kind, RecordKind::LePromisc);
        assert_eq!(r1.data[0], 1);
        assert_eq!(tracker.ctx.status & STATUS_FIFO_OVERFLOW, STATUS_FIFO_OVERFLOW);
    }

    /// After discovery the follower hops along the CSA#1 sequence on the
    /// connection-event cadence.
    #[test]
    fn connected_link_hops_on_the_event_cadence() {
        let mut tracker = Tracker::new(MockRadio::new(vec![]));
        let ctx = &mut tracker.ctx;
        ctx.mode = Mode::BtFollowLe;
        ctx.flags.request_mode(Mode::BtFollowLe);
        ctx.packet_handler = Some(PacketHandler::ConnectionFollow);
        ctx.link.phase = LinkPhase::Connected;
        ctx.link.conn_interval = 6;
        ctx.link.interval_timer = 0;
        ctx.link.channel_increment = 12;
        ctx.link.channel_idx = 3;
        ctx.link.last_packet = 0;
        ctx.hop.mode = HopMode::Btle;

        // One full interval of ticks (6 * 1.25 ms), then give the loop a
        // window boundary to act on.
        tracker.radio.push_step(Step::Ticks(6 * 4));
        tracker.poll();
        assert_eq!(tracker.ctx.link.channel_idx, 15);
        assert_eq!(tracker.ctx.link.conn_count, 1);
        assert!(tracker
            .radio
            .ops
            .contains(&Op::SetFrequency(codec::btle_channel_index_to_phys(15))));
    }
}
