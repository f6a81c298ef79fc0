//! BTLE link-layer follower state.
//!
//! Tracks one connection at a time through three phases: listening on an
//! advertising channel, connection pending (CONNECT_REQ seen, waiting for
//! the first data packet), and connected (hopping along with the link).
//! Connection parameter updates are parsed when announced and applied when
//! their instant comes up.

use crate::codec::rbit24;
use crate::flags::Flags;

/// Advertising access address.
pub const ADV_ACCESS_ADDRESS: u32 = 0x8e89_bed6;
/// Advertising CRC init (seed form).
pub const ADV_CRC_INIT: u32 = 0x55_5555;

/// Packet buffer: 4 access-address bytes plus up to 48 PDU bytes.
pub const LE_PKT_LEN: usize = 52;

/// Supervision timeout before giving a connection up, in 100 ns units (5 s).
pub const SUPERVISION_TIMEOUT: u32 = 50_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkPhase {
    /// Engine idle, no RX loop owns the link.
    Inactive,
    Listening,
    ConnPending,
    Connected,
}

#[derive(Clone, Copy, Debug)]
pub struct LeLink {
    pub access_address: u32,
    /// CRC init in seed form, and in LFSR-state (bit-reversed) form.
    pub crc_init: u32,
    pub crc_init_reversed: u32,
    pub crc_verify: bool,
    pub phase: LinkPhase,

    pub conn_epoch: u32,
    pub conn_interval: u16,
    pub interval_timer: u16,
    pub conn_count: u16,
    pub win_size: u8,
    pub win_offset: u16,
    pub channel_idx: u8,
    pub channel_increment: u8,

    pub update_pending: bool,
    pub win_size_update: u8,
    pub win_offset_update: u16,
    pub interval_update: u16,
    pub update_instant: u16,

    pub target: [u8; 6],
    pub target_set: bool,

    /// clk100ns of the last packet seen on this link.
    pub last_packet: u32,
}

impl Default for LeLink {
    fn default() -> LeLink {
        LeLink {
            access_address: ADV_ACCESS_ADDRESS,
            crc_init: ADV_CRC_INIT,
            crc_init_reversed: rbit24(ADV_CRC_INIT),
            crc_verify: true,
            phase: LinkPhase::Listening,
            conn_epoch: 0,
            conn_interval: 0,
            interval_timer: 0,
            conn_count: 0,
            win_size: 0,
            win_offset: 0,
            channel_idx: 0,
            channel_increment: 0,
            update_pending: false,
            win_size_update: 0,
            win_offset_update: 0,
            interval_update: 0,
            update_instant: 0,
            target: [0; 6],
            target_set: false,
            last_packet: 0,
        }
    }
}

impl LeLink {
    /// Back to listening on the advertising access address. The host's
    /// target filter survives; it is cleared by its own command.
    pub fn reset(&mut self) {
        let target = self.target;
        let target_set = self.target_set;
        *self = LeLink::default();
        self.target = target;
        self.target_set = target_set;
    }

    pub fn set_access_address(&mut self, aa: u32) {
        self.access_address = aa;
    }

    pub fn set_target(&mut self, mac: [u8; 6]) {
        self.target = mac;
        self.target_set = true;
    }

    pub fn clear_target(&mut self) {
        self.target = [0; 6];
        self.target_set = false;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowEvent {
    Ignored,
    /// CONNECT_REQ accepted; parameters latched, first hop signalled.
    Accepted,
    /// First data packet of the connection anchored the timing.
    Established,
}

/// Advance the follower with one CRC-screened packet.
///
/// `p` is the assembled packet: access address at `[0..4]`, PDU from `[4]`.
pub fn connection_follow(
    link: &mut LeLink,
    flags: &Flags,
    clkn: u32,
    p: &[u8; LE_PKT_LEN],
) -> FollowEvent {
    match link.phase {
        // Nothing owns the link; traffic on the wire is not ours to act on.
        LinkPhase::Inactive => FollowEvent::Ignored,
        LinkPhase::Listening => {
            // Only CONNECT_REQ moves us off the advertising channel.
            if p[4] & 0x0f != 0x05 {
                return FollowEvent::Ignored;
            }
            // Target filter: InitA at [6..12], AdvA at [12..18].
            if link.target_set && link.target != p[6..12] && link.target != p[12..18] {
                return FollowEvent::Ignored;
            }

            link.crc_verify = false;
            link.access_address = u32::from_le_bytes([p[18], p[19], p[20], p[21]]);
            link.crc_init = (p[24] as u32) << 16 | (p[23] as u32) << 8 | p[22] as u32;
            link.crc_init_reversed = rbit24(link.crc_init);
            link.win_size = p[25];
            // Single-byte reads: the high bytes of WinOffset and Interval
            // never feed the hop arithmetic below.
            link.win_offset = p[26] as u16;
            link.conn_interval = p[28] as u16;
            link.channel_increment = p[34] & 0x1f;
            link.channel_idx = link.channel_increment;
            link.phase = LinkPhase::ConnPending;
            flags.signal_hop();
            FollowEvent::Accepted
        }
        LinkPhase::ConnPending => {
            // First packet on the data channel anchors the event timing.
            link.conn_epoch = clkn;
            link.interval_timer = link.conn_interval.saturating_sub(1);
            link.conn_count = 0;
            link.update_pending = false;
            link.phase = LinkPhase::Connected;
            FollowEvent::Established
        }
        LinkPhase::Connected => {
            if link.update_pending && link.conn_count == link.update_instant {
                link.conn_epoch = clkn;
                link.conn_interval = link.interval_update;
                link.interval_timer = link.interval_update.saturating_sub(1);
                link.win_size = link.win_size_update;
                link.win_offset = link.win_offset_update;
                link.update_pending = false;
                info!("connection parameters updated");
            }

            let llid = p[4] & 0x03;
            // LL_CONNECTION_UPDATE_REQ: control PDU, opcode 0.
            if llid == 0x03 && p[6] == 0x00 {
                link.win_size_update = p[7];
                link.win_offset_update = u16::from_le_bytes([p[8], p[9]]);
                link.interval_update = u16::from_le_bytes([p[10], p[11]]);
                link.update_instant = u16::from_le_bytes([p[16], p[17]]);
                // A stale instant (already passed, modulo 2^16) is ignored.
                if link.update_instant.wrapping_sub(link.conn_count) < 32767 {
                    link.update_pending = true;
                }
            }
            FollowEvent::Ignored
        }
    }
}
