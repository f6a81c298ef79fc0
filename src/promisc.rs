//! Promiscuous BTLE connection recovery.
//!
//! With no CONNECT_REQ in hand, an already-running connection is recovered
//! in four stages, each handing off to the next by swapping the active
//! handler:
//!
//! 0. scan raw symbols for whitened empty-PDU headers and vote candidate
//!    access addresses in a small LFU cache;
//! 1. recover the CRC init from one empty data PDU by running the CRC LFSR
//!    backwards;
//! 2. estimate the hop interval from the smallest packet gap seen on a
//!    fixed channel;
//! 3. measure the time from data channel 1 to data channel 2 and look the
//!    hop increment up by modular inverse.
//!
//! After stage 3 the link state is handed to the connection follower as if
//! a CONNECT_REQ had been captured.

use heapless::Vec;

use crate::capture::SYMBOLS_LEN;
use crate::clock::{clk100ns_elapsed, LE_BASECLK};
use crate::codec::{btle_channel_index, crc24_reverse, rbit24, WHITENING, WHITENING_INDEX, WHITENING_LEN};
use crate::hop::HopMode;
use crate::link::{self, FollowEvent, LinkPhase, LE_PKT_LEN};
use crate::queue::{OutputRecord, RecordKind};
use crate::Context;

/// Access-address cache capacity.
pub const AA_CACHE_SIZE: usize = 32;

/// Sightings needed before an access address is trusted (promoted on the
/// first count above this).
pub const AA_PROMOTE_COUNT: u8 = 3;

/// Gaps above this (100 ns units, 4 s) are stale: no interval is that long.
const MAX_INTERVAL_GAP: u32 = 40_000_000;

/// Consecutive agreeing estimates required before the interval is trusted.
const INTERVAL_CONSENSUS: u8 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketHandler {
    ConnectionFollow,
    PromiscCrcInit,
    PromiscHopInterval,
    PromiscHopIncrement,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SymbolHandler {
    /// Hunt the known access address in the raw bitstream.
    FollowLe,
    /// Stage-0 candidate scan.
    PromiscScan,
}

#[derive(Clone, Copy, Debug)]
struct AaEntry {
    aa: u32,
    count: u8,
}

/// Least-frequently-used cache of candidate access addresses. On overflow
/// the entry with the lowest count is evicted; ties break toward the lowest
/// index, which is the oldest of the tied entries.
pub struct AaCache {
    entries: Vec<AaEntry, AA_CACHE_SIZE>,
}

impl AaCache {
    pub fn new() -> AaCache {
        AaCache {
            entries: Vec::new(),
        }
    }

    /// Record a sighting, returning the address's updated count.
    pub fn see(&mut self, aa: u32) -> u8 {
        if let Some(e) = self.entries.iter_mut().find(|e| e.aa == aa) {
            e.count = e.count.saturating_add(1);
            return e.count;
        }
        let entry = AaEntry { aa, count: 1 };
        if self.entries.push(entry).is_err() {
            let mut victim = 0;
            for (i, e) in self.entries.iter().enumerate() {
                if e.count < self.entries[victim].count {
                    victim = i;
                }
            }
            self.entries[victim] = entry;
        }
        1
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn count_of(&self, aa: u32) -> Option<u8> {
        self.entries.iter().find(|e| e.aa == aa).map(|e| e.count)
    }
}

pub struct PromiscState {
    pub aa_cache: AaCache,
    pub smallest_interval: u32,
    pub consec_intervals: u8,
    pub prev_clk100ns: u32,
    pub have_prev: bool,
    pub first_hop_ts: u32,
    pub awaiting_second_channel: bool,
}

impl PromiscState {
    pub fn new() -> PromiscState {
        PromiscState {
            aa_cache: AaCache::new(),
            smallest_interval: u32::MAX,
            consec_intervals: 0,
            prev_clk100ns: 0,
            have_prev: false,
            first_hop_ts: 0,
            awaiting_second_channel: false,
        }
    }

    pub fn reset(&mut self) {
        self.aa_cache.clear();
        self.smallest_interval = u32::MAX;
        self.consec_intervals = 0;
        self.prev_clk100ns = 0;
        self.have_prev = false;
        self.first_hop_ts = 0;
        self.awaiting_second_channel = false;
    }
}

const fn build_hop_increment_lut() -> [u8; 37] {
    // lut[k] = h with h * k == 1 (mod 37): hopping k channel indices per
    // event between two adjacent data channels pins the increment to the
    // modular inverse of the event count.
    let mut lut = [0u8; 37];
    let mut h = 1u32;
    while h < 37 {
        let mut k = 1u32;
        while k < 37 {
            if (h * k) % 37 == 1 {
                lut[k as usize] = h as u8;
            }
            k += 1;
        }
        h += 1;
    }
    lut
}

/// Hop increment by observed event count between data channels 1 and 2.
pub static HOP_INCREMENT_LUT: [u8; 37] = build_hop_increment_lut();

fn divide_round(a: u32, b: u32) -> u32 {
    (a + b / 2) / b
}

/// Push a discovery progress record toward the host: stage number followed
/// by the stage's recovered value.
fn report_state(ctx: &mut Context, stage: u8, data: &[u8]) {
    let mut rec = OutputRecord::empty(RecordKind::LePromisc);
    rec.channel = ctx.hop.channel.saturating_sub(2402) as u8;
    rec.clkn_high = ctx.clock.clkn_high();
    rec.clk100ns = ctx.clock.clk100ns();
    rec.data[0] = stage;
    rec.data[1..1 + data.len()].copy_from_slice(data);
    ctx.queue.push(rec, &mut ctx.status);
}

/// Route one CRC-screened packet to the active packet handler.
pub fn dispatch_packet(ctx: &mut Context, p: &[u8; LE_PKT_LEN]) {
    match ctx.packet_handler {
        None => {}
        Some(PacketHandler::ConnectionFollow) => {
            let clkn = ctx.clock.clkn();
            match link::connection_follow(&mut ctx.link, &ctx.flags, clkn, p) {
                FollowEvent::Accepted => {
                    info!("CONNECT_REQ accepted, following");
                }
                FollowEvent::Established => {
                    ctx.jam.arm();
                    info!("connection established");
                }
                FollowEvent::Ignored => {}
            }
        }
        Some(PacketHandler::PromiscCrcInit) => promisc_crc_init(ctx, p),
        Some(PacketHandler::PromiscHopInterval) => promisc_hop_interval(ctx),
        Some(PacketHandler::PromiscHopIncrement) => promisc_hop_increment(ctx),
    }
}

/// Stage 1: an empty data PDU (header 0x01, length 0) has known plaintext,
/// so its on-air CRC pins the seed exactly.
fn promisc_crc_init(ctx: &mut Context, p: &[u8; LE_PKT_LEN]) {
    if ctx.link.crc_verify || p[4] != 0x01 || p[5] != 0x00 {
        return;
    }
    let wire = (p[8] as u32) << 16 | (p[7] as u32) << 8 | p[6] as u32;
    let seed_rev = crc24_reverse(wire, &p[4..6]);
    ctx.link.crc_init_reversed = seed_rev;
    ctx.link.crc_init = rbit24(seed_rev);
    ctx.link.crc_verify = true;
    info!("crc init recovered: {}", ctx.link.crc_init);
    let init = ctx.link.crc_init.to_le_bytes();
    report_state(ctx, 1, &init[..3]);
    ctx.packet_handler = Some(PacketHandler::PromiscHopInterval);
}

/// Stage 2: sitting still on one data channel, the connection comes back
/// every full map cycle (37 hops), so the smallest inter-packet gap divided
/// by 37 time bases estimates the interval. Five agreeing estimates in a
/// row are required before moving on.
fn promisc_hop_interval(ctx: &mut Context) {
    let now = ctx.clock.clk100ns();
    if !ctx.promisc.have_prev {
        ctx.promisc.prev_clk100ns = now;
        ctx.promisc.have_prev = true;
        return;
    }
    let diff = clk100ns_elapsed(ctx.promisc.prev_clk100ns, now);
    ctx.promisc.prev_clk100ns = now;

    // Multiple packets inside one connection event are not a map cycle.
    if diff < 2 * LE_BASECLK {
        return;
    }
    if diff > MAX_INTERVAL_GAP {
        ctx.promisc.smallest_interval = u32::MAX;
        ctx.promisc.consec_intervals = 0;
        return;
    }
    if diff < ctx.promisc.smallest_interval {
        ctx.promisc.smallest_interval = diff;
    }

    let obsv = divide_round(ctx.promisc.smallest_interval, 37 * LE_BASECLK) as u16;
    if ctx.link.conn_interval == obsv {
        ctx.promisc.consec_intervals += 1;
        if ctx.promisc.consec_intervals == INTERVAL_CONSENSUS {
            info!("hop interval recovered: {}", obsv);
            report_state(ctx, 2, &obsv.to_le_bytes());
            ctx.packet_handler = Some(PacketHandler::PromiscHopIncrement);
            ctx.promisc.awaiting_second_channel = false;
            ctx.hop.direct_channel = 2404;
            ctx.hop.mode = HopMode::Direct;
            ctx.flags.signal_hop();
        }
    } else {
        ctx.link.conn_interval = obsv;
        ctx.promisc.consec_intervals = 0;
    }
}

/// Stage 3: time the connection from data channel index 1 (2404 MHz) to
/// index 2 (2406 MHz). Covering one index in k events means the increment
/// is the inverse of k modulo 37.
fn promisc_hop_increment(ctx: &mut Context) {
    let now = ctx.clock.clk100ns();
    if !ctx.promisc.awaiting_second_channel {
        ctx.promisc.first_hop_ts = now;
        ctx.promisc.awaiting_second_channel = true;
        ctx.hop.direct_channel = 2406;
        ctx.flags.signal_hop();
        return;
    }

    let delta = clk100ns_elapsed(ctx.promisc.first_hop_ts, now);
    let hops = divide_round(delta, ctx.link.conn_interval as u32 * LE_BASECLK);
    if hops >= 1 && hops < 37 {
        let increment = HOP_INCREMENT_LUT[hops as usize];
        ctx.link.channel_increment = increment;
        ctx.link.interval_timer = ctx.link.conn_interval / 2;
        ctx.link.conn_count = 0;
        ctx.link.conn_epoch = 0;
        ctx.link.channel_idx = (1 + increment) % 37;
        ctx.link.phase = LinkPhase::Connected;
        ctx.link.crc_verify = false;
        ctx.flags.clear_hop();
        ctx.hop.mode = HopMode::Btle;
        ctx.packet_handler = Some(PacketHandler::ConnectionFollow);
        ctx.jam.arm();
        info!("hop increment recovered: {}", increment);
        report_state(ctx, 3, &[increment]);
    } else {
        // Missed the visit; try the pair again.
        ctx.promisc.awaiting_second_channel = false;
        ctx.hop.direct_channel = 2404;
        ctx.flags.signal_hop();
    }
}

/// Route the unpacked symbol window to the active symbol handler. Returns
/// false when the handler wants out of the bitstream loop (handoff to
/// sync-gated RX).
pub fn dispatch_symbols(ctx: &mut Context) -> bool {
    match ctx.symbol_handler {
        None => true,
        Some(SymbolHandler::PromiscScan) => promisc_scan(ctx),
        Some(SymbolHandler::FollowLe) => follow_scan(ctx),
    }
}

/// Stage 0: look for the whitened bit patterns of empty data PDU headers
/// (LLID 1/2, with and without MD, length 0). A match 32 bits into a
/// packet puts the access address right before it.
fn promisc_scan(ctx: &mut Context) -> bool {
    let base = WHITENING_INDEX
        [btle_channel_index((ctx.hop.channel - 2402) as u8) as usize] as usize;

    // 16 whitened bits per candidate header byte, LSB first, length 0.
    let mut patterns = [[0u8; 16]; 4];
    for (pat, &hdr) in patterns.iter_mut().zip([0x01u8, 0x09, 0x05, 0x0d].iter()) {
        for b in 0..16 {
            let plain = if b < 8 { (hdr >> b) & 1 } else { 0 };
            pat[b] = plain ^ WHITENING[(base + b) % WHITENING_LEN];
        }
    }

    for i in 32..(SYMBOLS_LEN - 32 - 16) {
        let window = &ctx.symbols[i..i + 16];
        if !patterns.iter().any(|p| window == p) {
            continue;
        }
        // Decode access address (raw) and header (dewhitened).
        let start = i - 32;
        let mut bytes = [0u8; 10];
        for (j, byte) in bytes.iter_mut().enumerate() {
            for k in 0..8 {
                let mut bit = ctx.symbols[start + j * 8 + k];
                if j >= 4 {
                    bit ^= WHITENING[(base + (j - 4) * 8 + k) % WHITENING_LEN];
                }
                *byte |= bit << k;
            }
        }
        let aa = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        // Candidate traffic goes to the host while the votes accumulate.
        let mut rec = OutputRecord::empty(RecordKind::LePacket);
        rec.channel = ctx.hop.channel.saturating_sub(2402) as u8;
        rec.clkn_high = ctx.clock.clkn_high();
        rec.clk100ns = ctx.clock.clk100ns();
        rec.data[..bytes.len()].copy_from_slice(&bytes);
        ctx.queue.push(rec, &mut ctx.status);

        if ctx.promisc.aa_cache.see(aa) > AA_PROMOTE_COUNT {
            info!("access address promoted: {}", aa);
            ctx.link.set_access_address(aa);
            ctx.link.crc_verify = false;
            ctx.packet_handler = Some(PacketHandler::PromiscCrcInit);
            ctx.symbol_handler = Some(SymbolHandler::FollowLe);
            report_state(ctx, 0, &aa.to_le_bytes());
            return false;
        }
    }
    true
}

/// Hunt the configured access address bit-by-bit across the window and
/// decode the packet that follows it. Used when the radio is capturing an
/// unsynced bitstream but the access address is already known.
fn follow_scan(ctx: &mut Context) -> bool {
    let target = ctx.link.access_address;
    let base = WHITENING_INDEX
        [btle_channel_index((ctx.hop.channel - 2402) as u8) as usize] as usize;

    let mut aa: u32 = 0;
    for i in 0..31 {
        aa = (aa >> 1) | ((ctx.symbols[i] as u32) << 31);
    }
    // Start positions cover the older half; the decode may run into the
    // freshly captured half.
    for i in 31..(SYMBOLS_LEN / 2 + 32) {
        aa = (aa >> 1) | ((ctx.symbols[i] as u32) << 31);
        if aa != target {
            continue;
        }
        let start = i - 31;
        let mut packet = [0u8; LE_PKT_LEN];
        'bytes: for j in 0..46 {
            let mut byte = 0u8;
            for k in 0..8 {
                let offset = start + j * 8 + k;
                if offset >= SYMBOLS_LEN {
                    break 'bytes;
                }
                let mut bit = ctx.symbols[offset];
                if j >= 4 {
                    bit ^= WHITENING[(base + (j - 4) * 8 + k) % WHITENING_LEN];
                }
                byte |= bit << k;
            }
            packet[j] = byte;
        }
        dispatch_packet(ctx, &packet);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;

    #[test]
    fn hop_increment_lut_is_the_modular_inverse() {
        for k in 1..37u32 {
            let h = HOP_INCREMENT_LUT[k as usize] as u32;
            assert_eq!((h * k) % 37, 1, "k = {}", k);
        }
        assert_eq!(HOP_INCREMENT_LUT[16], 7);
    }

    #[test]
    fn aa_cache_evicts_least_frequent() {
        let mut cache = AaCache::new();
        // One address seen twice, then fill the cache with singles.
        cache.see(0xdead_beef);
        cache.see(0xdead_beef);
        for aa in 0..(AA_CACHE_SIZE as u32 - 1) {
            cache.see(aa);
        }
        // Full: the next insert evicts the lowest-count, lowest-index
        // entry, which is the single-sighting address 0.
        cache.see(0xcafe_f00d);
        assert_eq!(cache.count_of(0xdead_beef), Some(2));
        assert_eq!(cache.count_of(0), None);
        assert_eq!(cache.count_of(0xcafe_f00d), Some(1));

        // Re-observation bumps, not reinserts.
        assert_eq!(cache.see(0xcafe_f00d), 2);
    }

    fn interval_ctx() -> Context {
        let mut ctx = Context::new();
        ctx.packet_handler = Some(PacketHandler::PromiscHopInterval);
        ctx.link.conn_interval = 0;
        ctx
    }

    /// Feed a packet observation at an absolute tick count.
    fn observe_at(ctx: &mut Context, clkn: u32) {
        ctx.clock.set(clkn);
        dispatch_packet(ctx, &[0u8; LE_PKT_LEN]);
    }

    #[test]
    fn interval_consensus_needs_five_in_a_row() {
        let mut ctx = interval_ctx();
        // Gap of g intervals on a fixed channel = g * 37 * 1.25 ms, which
        // is g * 148 ticks when the interval estimate should read g.
        let gaps = [12u32, 11, 10, 10, 10, 10, 10];
        let mut t = 1000;
        observe_at(&mut ctx, t);
        for &g in &gaps {
            t += g * 37 * 4;
            observe_at(&mut ctx, t);
            assert_eq!(
                ctx.packet_handler,
                Some(PacketHandler::PromiscHopInterval),
                "promoted early at gap {}",
                g
            );
        }
        // Estimate settled at 10 with four agreements so far; the fifth
        // triggers the handoff.
        t += 10 * 37 * 4;
        observe_at(&mut ctx, t);
        assert_eq!(ctx.link.conn_interval, 10);
        assert_eq!(ctx.packet_handler, Some(PacketHandler::PromiscHopIncrement));
        assert_eq!(ctx.hop.mode, HopMode::Direct);
        assert_eq!(ctx.hop.direct_channel, 2404);
        assert!(ctx.flags.hop_pending());
    }

    #[test]
    fn interval_dip_settles_consensus_on_the_minimum() {
        let mut ctx = interval_ctx();
        // A shorter gap mid-run lowers the running minimum; the estimate
        // drops with it, the agreement count starts over and consensus
        // settles on the post-dip value.
        let gaps = [10u32, 10, 10, 9, 10, 10, 10, 10, 10];
        let mut t = 1000;
        observe_at(&mut ctx, t);
        for &g in &gaps {
            t += g * 37 * 4;
            observe_at(&mut ctx, t);
        }
        assert_eq!(ctx.link.conn_interval, 9);
        assert_eq!(ctx.packet_handler, Some(PacketHandler::PromiscHopIncrement));
        assert_eq!(ctx.hop.mode, HopMode::Direct);
    }

    #[test]
    fn sub_event_gaps_are_ignored() {
        let mut ctx = interval_ctx();
        ctx.link.conn_interval = 10;
        ctx.promisc.consec_intervals = 4;
        observe_at(&mut ctx, 1000);
        // More frames inside the same connection event (one tick apart)
        // must not disturb the consensus.
        observe_at(&mut ctx, 1001);
        observe_at(&mut ctx, 1002);
        assert_eq!(ctx.promisc.consec_intervals, 4);
        assert_eq!(ctx.packet_handler, Some(PacketHandler::PromiscHopInterval));
    }

    #[test]
    fn increment_recovery_connects_the_link() {
        let mut ctx = Context::new();
        ctx.packet_handler = Some(PacketHandler::PromiscHopIncrement);
        ctx.link.conn_interval = 30;
        ctx.hop.mode = HopMode::Direct;
        ctx.hop.channel = 2404;

        // First sighting on 2404 sends us to 2406.
        observe_at(&mut ctx, 2000);
        assert!(ctx.promisc.awaiting_second_channel);
        assert_eq!(ctx.hop.direct_channel, 2406);
        assert!(ctx.flags.hop_pending());
        ctx.flags.clear_hop();
        ctx.hop.channel = 2406;

        // 16 events of 30 * 1.25 ms later the link shows up one index on:
        // increment = 16^-1 mod 37 = 7.
        observe_at(&mut ctx, 2000 + 16 * 30 * 4);
        assert_eq!(ctx.link.channel_increment, 7);
        assert_eq!(ctx.link.channel_idx, 8);
        assert_eq!(ctx.link.phase, LinkPhase::Connected);
        assert_eq!(ctx.link.interval_timer, 15);
        assert_eq!(ctx.hop.mode, HopMode::Btle);
        assert_eq!(ctx.packet_handler, Some(PacketHandler::ConnectionFollow));
        assert!(!ctx.flags.hop_pending());
    }

    #[test]
    fn missed_increment_window_retries() {
        let mut ctx = Context::new();
        ctx.packet_handler = Some(PacketHandler::PromiscHopIncrement);
        ctx.link.conn_interval = 10;
        ctx.hop.channel = 2404;
        observe_at(&mut ctx, 0);
        ctx.flags.clear_hop();
        ctx.hop.channel = 2406;
        // 40 events: out of range, start the pair over at 2404.
        observe_at(&mut ctx, 40 * 10 * 4);
        assert!(!ctx.promisc.awaiting_second_channel);
        assert_eq!(ctx.hop.direct_channel, 2404);
        assert!(ctx.flags.hop_pending());
        assert_ne!(ctx.link.phase, LinkPhase::Connected);
    }

    #[test]
    fn crc_init_recovery_from_empty_pdu() {
        let mut ctx = Context::new();
        ctx.packet_handler = Some(PacketHandler::PromiscCrcInit);
        ctx.link.crc_verify = false;

        let seed_rev = 0x63_41f2;
        let pdu = [0x01u8, 0x00];
        let crc = crate::codec::crc24(seed_rev, &pdu);
        let mut p = [0u8; LE_PKT_LEN];
        p[4] = 0x01;
        p[5] = 0x00;
        p[6] = crc as u8;
        p[7] = (crc >> 8) as u8;
        p[8] = (crc >> 16) as u8;
        dispatch_packet(&mut ctx, &p);

        assert!(ctx.link.crc_verify);
        assert_eq!(ctx.link.crc_init_reversed, seed_rev);
        assert_eq!(ctx.link.crc_init, rbit24(seed_rev));
        assert_eq!(ctx.packet_handler, Some(PacketHandler::PromiscHopInterval));
        // Progress record went out.
        let rec = ctx.queue.pop().unwrap();
        assert_eq!(rec.kind, RecordKind::LePromisc);
        assert_eq!(rec.data[0], 1);
    }

    /// Write a packet's bits into the symbol window at `start`, whitening
    /// PDU bytes for `channel`.
    fn lay_down(symbols: &mut [u8], start: usize, channel: u16, bytes: &[u8]) {
        let base = WHITENING_INDEX
            [btle_channel_index((channel - 2402) as u8) as usize] as usize;
        for (j, &b) in bytes.iter().enumerate() {
            for k in 0..8 {
                let mut bit = (b >> k) & 1;
                if j >= 4 {
                    bit ^= WHITENING[(base + (j - 4) * 8 + k) % WHITENING_LEN];
                }
                symbols[start + j * 8 + k] = bit;
            }
        }
    }

    #[test]
    fn symbol_scan_promotes_a_repeated_access_address() {
        let mut ctx = Context::new();
        ctx.symbol_handler = Some(SymbolHandler::PromiscScan);
        ctx.hop.channel = 2440;

        let aa = 0x50aa_33c6u32;
        let mut bytes = [0u8; 10];
        bytes[0..4].copy_from_slice(&aa.to_le_bytes());
        bytes[4] = 0x01; // empty data PDU
        bytes[5] = 0x00;
        // At offset 0 the header lands on the first scanned position, so
        // this match is always the first one processed.
        lay_down(&mut ctx.symbols, 0, 2440, &bytes);

        // Three sightings vote; the fourth promotes.
        for _ in 0..3 {
            assert!(dispatch_symbols(&mut ctx));
            assert_eq!(ctx.symbol_handler, Some(SymbolHandler::PromiscScan));
        }
        assert!(!dispatch_symbols(&mut ctx));
        assert_eq!(ctx.link.access_address, aa);
        assert_eq!(ctx.packet_handler, Some(PacketHandler::PromiscCrcInit));
        assert_eq!(ctx.symbol_handler, Some(SymbolHandler::FollowLe));
        // Every sighting reached the host as candidate traffic, then the
        // promotion progress record.
        for _ in 0..4 {
            let rec = ctx.queue.pop().unwrap();
            assert_eq!(rec.kind, RecordKind::LePacket);
            assert_eq!(&rec.data[..4], &aa.to_le_bytes());
            assert_eq!(rec.data[4], 0x01);
        }
        let rec = ctx.queue.pop().unwrap();
        assert_eq!(rec.kind, RecordKind::LePromisc);
        assert_eq!(rec.data[0], 0);
        assert_eq!(&rec.data[1..5], &aa.to_le_bytes());
        assert!(ctx.queue.is_empty());
    }

    #[test]
    fn follow_scan_decodes_at_the_access_address() {
        let mut ctx = Context::new();
        ctx.symbol_handler = Some(SymbolHandler::FollowLe);
        ctx.packet_handler = Some(PacketHandler::PromiscCrcInit);
        ctx.hop.channel = 2412;
        let aa = 0x8899_aabbu32;
        ctx.link.set_access_address(aa);
        ctx.link.crc_verify = false;

        let seed_rev = 0x12_3456;
        let pdu = [0x01u8, 0x00];
        let crc = crate::codec::crc24(seed_rev, &pdu);
        let mut bytes = [0u8; 9];
        bytes[0..4].copy_from_slice(&aa.to_le_bytes());
        bytes[4] = 0x01;
        bytes[5] = 0x00;
        bytes[6] = crc as u8;
        bytes[7] = (crc >> 8) as u8;
        bytes[8] = (crc >> 16) as u8;
        lay_down(&mut ctx.symbols, 57, 2412, &bytes);

        assert!(!dispatch_symbols(&mut ctx));
        // The decoded packet reached the CRC-recovery handler.
        assert!(ctx.link.crc_verify);
        assert_eq!(ctx.link.crc_init_reversed, seed_rev);
    }

    #[test]
    fn symbol_scan_scrubs_clean_noise() {
        let mut ctx = Context::new();
        ctx.symbol_handler = Some(SymbolHandler::PromiscScan);
        ctx.hop.channel = 2440;
        // All-zero symbols: whitening makes a zero window non-matching for
        // every candidate header at almost every offset; regardless, no
        // promotion may happen from a handful of scans.
        for _ in 0..3 {
            dispatch_symbols(&mut ctx);
        }
        assert_eq!(ctx.symbol_handler, Some(SymbolHandler::PromiscScan));
        assert_eq!(ctx.packet_handler, None);
    }
}
