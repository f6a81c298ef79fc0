//! RX/TX streaming loops.
//!
//! Each mode routine owns the radio until the host asks for another mode,
//! the hardware event source runs dry, or the routine hands off internally
//! (the promiscuous pipeline switching from bitstream scan to sync-gated
//! RX). Loops follow one shape: arm capture, sample RSSI while waiting for
//! a window, account status bits, process, re-arm.

use crate::capture::{BUF_LEN, SYMBOLS_LEN};
use crate::clock::{self, clk100ns_elapsed};
use crate::codec::{self, crc24, rbit24};
use crate::hardware::{HwEvent, Led, Radio};
use crate::hop::{self, HopMode};
use crate::link::{LinkPhase, ADV_ACCESS_ADDRESS, ADV_CRC_INIT, LE_PKT_LEN, SUPERVISION_TIMEOUT};
use crate::promisc::{self, PacketHandler, SymbolHandler};
use crate::queue::{
    OutputRecord, RecordKind, STATUS_CS_TRIGGER, STATUS_DISCARD, STATUS_DMA_ERROR,
    STATUS_DMA_OVERFLOW, STATUS_RSSI_TRIGGER,
};
use crate::{Context, EgoMode, JamMode, Mode, Modulation};

/// Capture windows a squelch trigger stays good for.
const CS_HOLD_TIME: u8 = 2;

/// Why a mode routine returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Exit {
    /// The host requested a different mode.
    ModeChange,
    /// The event source ran dry; yield to the embedding.
    Exhausted,
    /// Internal handoff (scan promoted, or a followed link was lost and
    /// the caller should restart discovery).
    Handoff,
}

/// Drain one hardware event. Event handling only moves flags and buffers;
/// all protocol work stays in the mode loops.
pub(crate) fn pump<R: Radio>(radio: &mut R, ctx: &mut Context) -> HwEvent {
    let ev = radio.poll_event();
    match ev {
        HwEvent::TimerTick => {
            clock::on_tick(
                &mut ctx.clock,
                ctx.hop.mode,
                ctx.hop.last_hop,
                ctx.hop.timeout,
                &mut ctx.link,
                &ctx.flags,
            );
        }
        HwEvent::TransferComplete => {
            radio.read_capture(ctx.buffers.active_mut());
            let high = ctx.clock.clkn_high();
            let ns = ctx.clock.clk100ns();
            ctx.buffers.swap(radio.frequency(), high, ns);
            ctx.flags.note_transfer();
        }
        HwEvent::TransferError => ctx.flags.note_transfer_error(),
        HwEvent::CsTrigger => ctx.flags.signal_cs(),
        HwEvent::HostRequest(mode) => ctx.flags.request_mode(mode),
        HwEvent::Idle => {}
    }
    ev
}

fn capture_record(ctx: &Context, kind: RecordKind) -> OutputRecord {
    let mut rec = OutputRecord::empty(kind);
    rec.channel = ctx.buffers.channel.saturating_sub(2402) as u8;
    rec.clkn_high = ctx.buffers.clkn_high;
    rec.clk100ns = ctx.buffers.clk100ns;
    rec.rssi_max = ctx.rssi.max();
    rec.rssi_min = ctx.rssi.min();
    rec.rssi_avg = ctx.rssi.avg();
    rec.rssi_count = ctx.rssi.count().min(255) as u8;
    rec.data = *ctx.buffers.idle();
    rec
}

/// Basic-rate symbol streaming (also Afh probing and Ego capture): every
/// completed window goes out as a record, qualified or not.
pub(crate) fn stream_rx_loop<R: Radio>(
    radio: &mut R,
    ctx: &mut Context,
    kind: RecordKind,
) -> Exit {
    let my_mode = ctx.mode;
    radio.set_led(Led::Rx, true);
    radio.configure_rx(ctx.modulation);
    hop::retune(radio, &mut ctx.hop, &mut ctx.squelch, &ctx.flags, false);
    radio.start_capture();

    let exit = 'run: loop {
        if ctx.flags.requested_mode() != my_mode {
            break 'run Exit::ModeChange;
        }
        ctx.rssi.reset_window();
        while ctx.flags.transfers_pending() == 0 && ctx.flags.transfer_errors_pending() == 0 {
            if ctx.flags.hop_pending() {
                hop::hop(
                    radio,
                    &mut ctx.hop,
                    &mut ctx.link,
                    &mut ctx.squelch,
                    &ctx.flags,
                    ctx.clock.clkn(),
                    false,
                );
            }
            let s = radio.rssi();
            ctx.rssi.add(s);
            if pump(radio, ctx) == HwEvent::Idle {
                break 'run Exit::Exhausted;
            }
            if ctx.flags.requested_mode() != my_mode {
                break 'run Exit::ModeChange;
            }
        }

        let transfers = ctx.flags.take_transfers();
        if ctx.flags.take_transfer_errors() > 0 {
            ctx.status |= STATUS_DMA_ERROR;
        }
        if transfers > 1 {
            ctx.status |= STATUS_DMA_OVERFLOW;
        }
        if ctx.flags.take_discard() {
            ctx.status |= STATUS_DISCARD;
        }

        let channel = ctx.buffers.channel;
        ctx.rssi.iir_update(channel);
        let mut qualified = false;
        if ctx.flags.cs_pending() {
            ctx.flags.clear_cs();
            ctx.status |= STATUS_CS_TRIGGER;
            qualified = true;
        }
        if ctx.squelch.rssi_trigger(ctx.rssi.max()) {
            ctx.status |= STATUS_RSSI_TRIGGER;
            qualified = true;
        }
        // A live window tells the AFH prober this channel is in use. Only
        // this window's triggers count; the status byte can still carry
        // bits from a record that failed to enqueue.
        if my_mode == Mode::Afh && qualified {
            ctx.hop.mark_used(channel);
        }

        let rec = capture_record(ctx, kind);
        ctx.queue.push(rec, &mut ctx.status);
        radio.start_capture();
    };

    radio.set_led(Led::Rx, false);
    exit
}

/// Unsynchronized LE bitstream RX: squelch-qualified windows are unpacked
/// into the two-window symbol history and fed to the symbol handler.
pub(crate) fn bt_generic_le<R: Radio>(radio: &mut R, ctx: &mut Context) -> Exit {
    let my_mode = ctx.mode;
    radio.set_led(Led::Rx, true);
    radio.configure_rx(Modulation::LowEnergy);
    hop::retune(radio, &mut ctx.hop, &mut ctx.squelch, &ctx.flags, false);
    radio.start_capture();

    let mut hold: u8 = 0;
    let exit = 'run: loop {
        if ctx.flags.requested_mode() != my_mode {
            break 'run Exit::ModeChange;
        }
        ctx.rssi.reset_window();
        while ctx.flags.transfers_pending() == 0 && ctx.flags.transfer_errors_pending() == 0 {
            if ctx.flags.hop_pending() {
                hop::hop(
                    radio,
                    &mut ctx.hop,
                    &mut ctx.link,
                    &mut ctx.squelch,
                    &ctx.flags,
                    ctx.clock.clkn(),
                    false,
                );
            }
            let s = radio.rssi();
            ctx.rssi.add(s);
            if pump(radio, ctx) == HwEvent::Idle {
                break 'run Exit::Exhausted;
            }
            if ctx.flags.requested_mode() != my_mode {
                break 'run Exit::ModeChange;
            }
        }

        let transfers = ctx.flags.take_transfers();
        if ctx.flags.take_transfer_errors() > 0 {
            ctx.status |= STATUS_DMA_ERROR;
        }
        if transfers > 1 {
            ctx.status |= STATUS_DMA_OVERFLOW;
        }
        let discard = ctx.flags.take_discard();
        if discard {
            ctx.status |= STATUS_DISCARD;
        }
        if ctx.flags.cs_pending() {
            ctx.flags.clear_cs();
            ctx.status |= STATUS_CS_TRIGGER;
            hold = CS_HOLD_TIME;
        }
        if ctx.squelch.rssi_trigger(ctx.rssi.max()) {
            ctx.status |= STATUS_RSSI_TRIGGER;
            hold = CS_HOLD_TIME;
        }
        if ctx.squelch.no_squelch() {
            hold = CS_HOLD_TIME;
        }

        // Quiet (or straddling) windows are not worth a bit-by-bit scan.
        if hold == 0 || discard {
            radio.start_capture();
            continue;
        }
        hold -= 1;

        ctx.symbols.copy_within(SYMBOLS_LEN / 2.., 0);
        for (i, &b) in ctx.buffers.idle().iter().enumerate() {
            for k in 0..8 {
                ctx.symbols[SYMBOLS_LEN / 2 + i * 8 + k] = (b >> (7 - k)) & 1;
            }
        }
        let keep = promisc::dispatch_symbols(ctx);
        radio.start_capture();
        if !keep {
            break 'run Exit::Handoff;
        }
    };

    radio.set_led(Led::Rx, false);
    exit
}

/// Sync-word-gated LE RX: one packet per capture window. Handles host
/// retune requests, the supervision timeout, jam bursts and the hop flag.
pub(crate) fn bt_le_sync<R: Radio>(radio: &mut R, ctx: &mut Context) -> Exit {
    let my_mode = ctx.mode;
    if ctx.link.phase == LinkPhase::Inactive {
        ctx.link.phase = LinkPhase::Listening;
    }
    let mut saved_request: u16 = 0;
    radio.set_led(Led::Rx, true);
    radio.configure_rx_sync(Modulation::LowEnergy, ctx.link.access_address);
    hop::retune(radio, &mut ctx.hop, &mut ctx.squelch, &ctx.flags, false);
    radio.start_capture();

    let exit = 'run: loop {
        if ctx.flags.requested_mode() != my_mode {
            break 'run Exit::ModeChange;
        }
        if let Some(ch) = ctx.flags.take_channel_request() {
            // Remember where the host pointed us; a torn-down follow
            // returns there.
            saved_request = ch;
            ctx.hop.channel = ch;
            hop::retune(radio, &mut ctx.hop, &mut ctx.squelch, &ctx.flags, false);
        }

        ctx.rssi.reset_window();
        while ctx.flags.transfers_pending() == 0
            && ctx.flags.transfer_errors_pending() == 0
            && !ctx.flags.hop_pending()
            && !ctx.flags.channel_request_pending()
        {
            if pump(radio, ctx) == HwEvent::Idle {
                break 'run Exit::Exhausted;
            }
            if ctx.flags.requested_mode() != my_mode {
                break 'run Exit::ModeChange;
            }
        }
        let s = radio.rssi();
        ctx.rssi.add(s);

        let transfers = ctx.flags.take_transfers();
        if ctx.flags.take_transfer_errors() > 0 {
            ctx.status |= STATUS_DMA_ERROR;
        }
        if transfers > 1 {
            ctx.status |= STATUS_DMA_OVERFLOW;
        }

        if transfers > 0 {
            if ctx.flags.take_discard() {
                ctx.status |= STATUS_DISCARD;
            } else {
                let mut p = [0u8; LE_PKT_LEN];
                p[0..4].copy_from_slice(&ctx.link.access_address.to_le_bytes());
                let raw = *ctx.buffers.idle();
                codec::dewhiten(ctx.buffers.channel, &raw[..48], &mut p[4..]);

                let len = 2 + (p[5] & 0x3f) as usize;
                if len <= 39 {
                    let passes = if ctx.link.crc_verify {
                        codec::crc24_check(
                            ctx.link.crc_init_reversed,
                            &p[4..4 + len],
                            &p[4 + len..4 + len + 3],
                        )
                    } else {
                        true
                    };
                    if passes {
                        promisc::dispatch_packet(ctx, &p);
                        let mut rec = capture_record(ctx, RecordKind::LePacket);
                        rec.data.copy_from_slice(&p[..BUF_LEN]);
                        ctx.queue.push(rec, &mut ctx.status);
                        ctx.link.last_packet = ctx.clock.clk100ns();
                    }
                }
            }
        }

        // Supervision timeout, or the end of a jam burst, tears the link
        // down.
        let now = ctx.clock.clk100ns();
        let lost = matches!(
            ctx.link.phase,
            LinkPhase::Connected | LinkPhase::ConnPending
        ) && clk100ns_elapsed(ctx.link.last_packet, now) > SUPERVISION_TIMEOUT;
        if lost || ctx.jam.count == 1 {
            warn!("link lost, tearing down");
            ctx.link.reset();
            ctx.jam.count = 0;
            if ctx.jam.mode == JamMode::Once {
                ctx.jam.mode = JamMode::None;
                ctx.flags.request_mode(Mode::Idle);
                break 'run Exit::ModeChange;
            }
            if my_mode == Mode::BtPromiscLe {
                break 'run Exit::Handoff;
            }
            ctx.hop.channel = if saved_request != 0 { saved_request } else { 2402 };
            radio.configure_rx_sync(Modulation::LowEnergy, ctx.link.access_address);
            hop::retune(radio, &mut ctx.hop, &mut ctx.squelch, &ctx.flags, false);
        }

        // The access address may have changed above (CONNECT_REQ or a
        // teardown); keep the correlator current.
        radio.set_sync_word(ctx.link.access_address);
        if ctx.flags.hop_pending() {
            hop::hop(
                radio,
                &mut ctx.hop,
                &mut ctx.link,
                &mut ctx.squelch,
                &ctx.flags,
                ctx.clock.clkn(),
                false,
            );
        }
        if ctx.jam.count > 0 {
            radio.jam();
            ctx.jam.count -= 1;
        }
        radio.start_capture();
    };

    radio.set_led(Led::Rx, false);
    exit
}

/// Promiscuous recovery driver: bitstream scan until an access address is
/// promoted, then sync-gated RX through the remaining stages. A lost link
/// restarts the whole pipeline.
pub(crate) fn bt_promisc_le<R: Radio>(radio: &mut R, ctx: &mut Context) -> Exit {
    loop {
        if ctx.flags.requested_mode() != Mode::BtPromiscLe {
            return Exit::ModeChange;
        }
        ctx.promisc.reset();
        ctx.link.reset();
        // The scan patterns assume the even-MHz whitening phase.
        if ctx.hop.channel % 2 == 1 {
            ctx.hop.channel = 2440;
        }
        ctx.hop.mode = HopMode::None;
        ctx.symbol_handler = Some(SymbolHandler::PromiscScan);
        ctx.packet_handler = None;
        match bt_generic_le(radio, ctx) {
            Exit::Handoff => {}
            other => return other,
        }

        ctx.packet_handler = Some(PacketHandler::PromiscCrcInit);
        ctx.link.crc_verify = false;
        match bt_le_sync(radio, ctx) {
            Exit::Handoff => continue,
            other => return other,
        }
    }
}

/// Spectrum sweep: 16 (frequency, RSSI) triples per record.
pub(crate) fn specan<R: Radio>(radio: &mut R, ctx: &mut Context) -> Exit {
    let my_mode = ctx.mode;
    let mut rec = OutputRecord::empty(RecordKind::Specan);
    let mut n = 0;
    let exit = 'run: loop {
        for f in ctx.specan_low..=ctx.specan_high {
            if pump(radio, ctx) == HwEvent::Idle {
                break 'run Exit::Exhausted;
            }
            if ctx.flags.requested_mode() != my_mode {
                break 'run Exit::ModeChange;
            }
            radio.strobe_off();
            radio.wait_unlock();
            radio.set_frequency(f);
            radio.strobe_fs_on();
            radio.wait_lock();
            radio.strobe_rx();
            let level = radio.rssi();
            rec.data[n] = (f >> 8) as u8;
            rec.data[n + 1] = f as u8;
            rec.data[n + 2] = level as u8;
            n += 3;
            if n + 3 > BUF_LEN {
                rec.clkn_high = ctx.clock.clkn_high();
                rec.clk100ns = ctx.clock.clk100ns();
                ctx.queue.push(rec, &mut ctx.status);
                rec = OutputRecord::empty(RecordKind::Specan);
                n = 0;
            }
        }
    };
    radio.strobe_off();
    exit
}

/// Three-channel spectrum display on the LEDs.
pub(crate) fn led_specan<R: Radio>(radio: &mut R, ctx: &mut Context) -> Exit {
    const CHANNELS: [(u16, Led); 3] = [(2412, Led::Tx), (2437, Led::Rx), (2462, Led::Usr)];
    let my_mode = ctx.mode;
    let exit = 'run: loop {
        for &(f, led) in CHANNELS.iter() {
            if pump(radio, ctx) == HwEvent::Idle {
                break 'run Exit::Exhausted;
            }
            if ctx.flags.requested_mode() != my_mode {
                break 'run Exit::ModeChange;
            }
            radio.strobe_off();
            radio.wait_unlock();
            radio.set_frequency(f);
            radio.strobe_fs_on();
            radio.wait_lock();
            radio.strobe_rx();
            let level = radio.rssi();
            radio.set_led(led, level > ctx.rssi_threshold);
        }
    };
    radio.strobe_off();
    exit
}

/// Fixed test payload on the basic-rate channel, one packet per slot pair
/// (1600 Hz clock, transmit every other tick).
pub(crate) fn br_transmit<R: Radio>(radio: &mut R, ctx: &mut Context) -> Exit {
    const TEST_PAYLOAD: [u8; 16] = [0x55; 16];
    let my_mode = ctx.mode;
    radio.set_led(Led::Tx, true);
    hop::retune(radio, &mut ctx.hop, &mut ctx.squelch, &ctx.flags, true);
    let exit = 'run: loop {
        if ctx.flags.requested_mode() != my_mode {
            break 'run Exit::ModeChange;
        }
        radio.transmit(&TEST_PAYLOAD);
        let mut ticks = 0;
        while ticks < 2 {
            match pump(radio, ctx) {
                HwEvent::Idle => break 'run Exit::Exhausted,
                HwEvent::TimerTick => ticks += 1,
                _ => {}
            }
            if ctx.flags.requested_mode() != my_mode {
                break 'run Exit::ModeChange;
            }
        }
    };
    radio.set_led(Led::Tx, false);
    exit
}

/// Whiten and pack a PDU for the air and hand it to the radio: access
/// address first, every byte bit-reversed into over-the-air order.
pub(crate) fn le_transmit<R: Radio>(radio: &mut R, channel: u16, aa: u32, pdu: &[u8]) {
    let mut air = [0u8; 4 + 48];
    for (o, b) in air[..4].iter_mut().zip(aa.to_le_bytes().iter()) {
        *o = b.reverse_bits();
    }
    let mut wh = codec::Whitener::for_channel(channel);
    for (o, &b) in air[4..].iter_mut().zip(pdu.iter()) {
        *o = wh.apply_byte(b).reverse_bits();
    }
    radio.transmit(&air[..4 + pdu.len()]);
}

/// Advertise as an LE slave: ADV_IND with the configured address every
/// 100 ms, CRC appended, on the advertising access address.
pub(crate) fn bt_slave_le<R: Radio>(radio: &mut R, ctx: &mut Context) -> Exit {
    let my_mode = ctx.mode;
    radio.set_led(Led::Tx, true);
    hop::retune(radio, &mut ctx.hop, &mut ctx.squelch, &ctx.flags, true);

    // header, AdvA (reversed), AD: flags = LE general discoverable.
    let mut pdu = [0u8; 14];
    pdu[0] = 0x00;
    pdu[1] = 0x09;
    for i in 0..6 {
        pdu[2 + i] = ctx.slave_mac[5 - i];
    }
    pdu[8] = 0x02;
    pdu[9] = 0x01;
    pdu[10] = 0x05;
    let crc = crc24(rbit24(ADV_CRC_INIT), &pdu[..11]);
    pdu[11] = crc as u8;
    pdu[12] = (crc >> 8) as u8;
    pdu[13] = (crc >> 16) as u8;

    let exit = 'run: loop {
        if ctx.flags.requested_mode() != my_mode {
            break 'run Exit::ModeChange;
        }
        le_transmit(radio, ctx.hop.channel, ADV_ACCESS_ADDRESS, &pdu);
        radio.delay_ms(100);
        if pump(radio, ctx) == HwEvent::Idle {
            break 'run Exit::Exhausted;
        }
    };
    radio.set_led(Led::Tx, false);
    exit
}

/// Ego capture or jam, depending on the configured sub-mode.
pub(crate) fn ego<R: Radio>(radio: &mut R, ctx: &mut Context) -> Exit {
    match ctx.ego_mode {
        EgoMode::Jam => {
            let my_mode = ctx.mode;
            hop::retune(radio, &mut ctx.hop, &mut ctx.squelch, &ctx.flags, true);
            loop {
                if ctx.flags.requested_mode() != my_mode {
                    return Exit::ModeChange;
                }
                radio.jam();
                if pump(radio, ctx) == HwEvent::Idle {
                    return Exit::Exhausted;
                }
            }
        }
        EgoMode::Follow | EgoMode::ContinuousRx => stream_rx_loop(radio, ctx, RecordKind::Ego),
    }
}
