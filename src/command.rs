//! Host command surface.
//!
//! Commands are synchronous request/response: the transport shim decodes a
//! request number plus two 16-bit arguments and an optional payload, calls
//! [`dispatch`], and ships back however many bytes it wrote. Mode switches
//! only flip the requested-mode cell; the running mode loop notices and
//! unwinds on its own.

use crate::hardware::{Led, Radio};
use crate::hop::{self, HopMode, MAX_CHANNEL, MIN_CHANNEL};
use crate::queue::OutputRecord;
use crate::{Context, EgoMode, JamMode, Mode, Modulation};

/// Protocol version reported to the host.
pub const API_VERSION: u16 = 0x0103;

/// Serialized size of one output record.
pub const RECORD_LEN: usize = 64;

/// Highest front-end register address covered by ReadAllRegisters.
const REGISTER_COUNT: u8 = 0x2e;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// Request number outside the table.
    UnknownRequest,
    /// An argument failed validation.
    InvalidArgument,
    /// The payload in or out is too short for the request.
    ShortBuffer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Request {
    Ping = 0,
    RxSymbols = 1,
    TxSymbols = 2,
    Stop = 3,
    Reset = 4,
    Specan = 5,
    LedSpecan = 6,
    TxTest = 7,
    RangeTest = 8,
    Repeater = 9,
    Afh = 10,
    BtleSniff = 11,
    BtlePromisc = 12,
    BtleSlave = 13,
    Ego = 14,
    GetLed = 15,
    SetLed = 16,
    GetPartNum = 17,
    GetSerial = 18,
    GetApiVersion = 19,
    GetBuildInfo = 20,
    GetModulation = 21,
    SetModulation = 22,
    GetChannel = 23,
    SetChannel = 24,
    GetSquelch = 25,
    SetSquelch = 26,
    SetTargetAddress = 27,
    BtleSetTarget = 28,
    StartHopping = 29,
    Hop = 30,
    SetClock = 31,
    GetClock = 32,
    TrimClock = 33,
    SetAfhMap = 34,
    ClearAfhMap = 35,
    GetAccessAddress = 36,
    SetAccessAddress = 37,
    GetCrcVerify = 38,
    SetCrcVerify = 39,
    ReadRegister = 40,
    WriteRegister = 41,
    WriteRegisters = 42,
    ReadAllRegisters = 43,
    JamMode = 44,
    Poll = 45,
    Flash = 46,
}

impl Request {
    pub fn from_u8(raw: u8) -> Option<Request> {
        use Request::*;
        const TABLE: [Request; 47] = [
            Ping,
            RxSymbols,
            TxSymbols,
            Stop,
            Reset,
            Specan,
            LedSpecan,
            TxTest,
            RangeTest,
            Repeater,
            Afh,
            BtleSniff,
            BtlePromisc,
            BtleSlave,
            Ego,
            GetLed,
            SetLed,
            GetPartNum,
            GetSerial,
            GetApiVersion,
            GetBuildInfo,
            GetModulation,
            SetModulation,
            GetChannel,
            SetChannel,
            GetSquelch,
            SetSquelch,
            SetTargetAddress,
            BtleSetTarget,
            StartHopping,
            Hop,
            SetClock,
            GetClock,
            TrimClock,
            SetAfhMap,
            ClearAfhMap,
            GetAccessAddress,
            SetAccessAddress,
            GetCrcVerify,
            SetCrcVerify,
            ReadRegister,
            WriteRegister,
            WriteRegisters,
            ReadAllRegisters,
            JamMode,
            Poll,
            Flash,
        ];
        TABLE.get(raw as usize).copied()
    }
}

fn led_from_index(index: u16) -> Result<Led, CommandError> {
    match index {
        0 => Ok(Led::Usr),
        1 => Ok(Led::Rx),
        2 => Ok(Led::Tx),
        _ => Err(CommandError::InvalidArgument),
    }
}

fn need(out: &[u8], len: usize) -> Result<(), CommandError> {
    if out.len() < len {
        Err(CommandError::ShortBuffer)
    } else {
        Ok(())
    }
}

/// Lay one record out in the host wire format.
fn serialize_record(rec: &OutputRecord, out: &mut [u8]) -> usize {
    out[0] = rec.kind as u8;
    out[1] = rec.status;
    out[2] = rec.channel;
    out[3] = rec.clkn_high;
    out[4..8].copy_from_slice(&rec.clk100ns.to_le_bytes());
    out[8] = rec.rssi_max as u8;
    out[9] = rec.rssi_min as u8;
    out[10] = rec.rssi_avg as u8;
    out[11] = rec.rssi_count;
    out[12] = 0;
    out[13] = 0;
    out[14..RECORD_LEN].copy_from_slice(&rec.data);
    RECORD_LEN
}

/// Execute one host command. Returns the number of bytes written to
/// `data_out`.
pub fn dispatch<R: Radio>(
    radio: &mut R,
    ctx: &mut Context,
    request: u8,
    value: u16,
    index: u16,
    data_in: &[u8],
    data_out: &mut [u8],
) -> Result<usize, CommandError> {
    let request = Request::from_u8(request).ok_or(CommandError::UnknownRequest)?;
    debug!("command {}", request as u8);

    match request {
        Request::Ping => Ok(0),

        // -- mode switches --------------------------------------------------
        Request::RxSymbols => {
            ctx.flags.request_mode(Mode::RxSymbols);
            Ok(0)
        }
        Request::TxSymbols => {
            ctx.flags.request_mode(Mode::TxSymbols);
            Ok(0)
        }
        Request::Stop => {
            ctx.flags.request_mode(Mode::Idle);
            Ok(0)
        }
        Request::Reset => {
            ctx.flags.request_mode(Mode::Reset);
            Ok(0)
        }
        Request::Specan => {
            let (low, high) = (value, index);
            if low >= high || low < 2049 || high > 3072 {
                return Err(CommandError::InvalidArgument);
            }
            ctx.specan_low = low;
            ctx.specan_high = high;
            ctx.flags.request_mode(Mode::Specan);
            Ok(0)
        }
        Request::LedSpecan => {
            ctx.rssi_threshold = value as i8;
            ctx.flags.request_mode(Mode::LedSpecan);
            Ok(0)
        }
        Request::TxTest => {
            ctx.flags.request_mode(Mode::TxTest);
            Ok(0)
        }
        Request::RangeTest => {
            ctx.flags.request_mode(Mode::RangeTest);
            Ok(0)
        }
        Request::Repeater => {
            ctx.flags.request_mode(Mode::Repeater);
            Ok(0)
        }
        Request::Afh => {
            if value > 0 {
                ctx.hop.timeout = value as u32;
            }
            ctx.hop.mode = HopMode::Afh;
            ctx.flags.request_mode(Mode::Afh);
            Ok(0)
        }
        Request::BtleSniff => {
            ctx.link.reset();
            ctx.promisc.reset();
            ctx.hop.mode = HopMode::Btle;
            ctx.flags.request_mode(Mode::BtFollowLe);
            Ok(0)
        }
        Request::BtlePromisc => {
            ctx.flags.request_mode(Mode::BtPromiscLe);
            Ok(0)
        }
        Request::BtleSlave => {
            if data_in.len() < 6 {
                return Err(CommandError::ShortBuffer);
            }
            ctx.slave_mac.copy_from_slice(&data_in[..6]);
            ctx.flags.request_mode(Mode::BtSlaveLe);
            Ok(0)
        }
        Request::Ego => {
            ctx.ego_mode = match value {
                0 => EgoMode::Follow,
                1 => EgoMode::ContinuousRx,
                2 => EgoMode::Jam,
                _ => return Err(CommandError::InvalidArgument),
            };
            ctx.flags.request_mode(Mode::Ego);
            Ok(0)
        }

        // -- device info and LEDs -------------------------------------------
        Request::GetLed => {
            need(data_out, 1)?;
            data_out[0] = radio.led(led_from_index(index)?) as u8;
            Ok(1)
        }
        Request::SetLed => {
            radio.set_led(led_from_index(index)?, value != 0);
            Ok(0)
        }
        Request::GetPartNum => {
            need(data_out, 5)?;
            data_out[0] = 0;
            data_out[1..5].copy_from_slice(&radio.part_number().to_le_bytes());
            Ok(5)
        }
        Request::GetSerial => {
            need(data_out, 17)?;
            data_out[0] = 0;
            data_out[1..17].copy_from_slice(&radio.serial_number());
            Ok(17)
        }
        Request::GetApiVersion => {
            need(data_out, 2)?;
            data_out[..2].copy_from_slice(&API_VERSION.to_le_bytes());
            Ok(2)
        }
        Request::GetBuildInfo => {
            let info = concat!("bluetick-", env!("CARGO_PKG_VERSION")).as_bytes();
            need(data_out, info.len())?;
            data_out[..info.len()].copy_from_slice(info);
            Ok(info.len())
        }

        // -- radio configuration --------------------------------------------
        Request::GetModulation => {
            need(data_out, 1)?;
            data_out[0] = ctx.modulation as u8;
            Ok(1)
        }
        Request::SetModulation => {
            ctx.modulation = match value {
                0 => Modulation::BasicRate,
                1 => Modulation::LowEnergy,
                _ => return Err(CommandError::InvalidArgument),
            };
            Ok(0)
        }
        Request::GetChannel => {
            need(data_out, 2)?;
            data_out[..2].copy_from_slice(&ctx.hop.channel.to_le_bytes());
            Ok(2)
        }
        Request::SetChannel => {
            if value > MAX_CHANNEL {
                // Past the band ceiling means "sweep everything".
                ctx.hop.mode = HopMode::Sweep;
                ctx.hop.channel = MIN_CHANNEL;
            } else {
                let channel = value.max(MIN_CHANNEL);
                if ctx.flags.requested_mode() == Mode::BtFollowLe {
                    // The sync loop owns the radio; hand the retune over.
                    ctx.flags.request_channel(channel);
                    return Ok(0);
                }
                ctx.hop.mode = HopMode::None;
                ctx.hop.channel = channel;
            }
            if ctx.mode != Mode::Idle {
                hop::retune(radio, &mut ctx.hop, &mut ctx.squelch, &ctx.flags, false);
            }
            Ok(0)
        }
        Request::GetSquelch => {
            need(data_out, 1)?;
            data_out[0] = ctx.squelch.requested() as u8;
            Ok(1)
        }
        Request::SetSquelch => {
            ctx.squelch.set_request(value as i8);
            Ok(0)
        }

        // -- targets and hopping --------------------------------------------
        Request::SetTargetAddress => {
            if data_in.len() < 6 {
                return Err(CommandError::ShortBuffer);
            }
            ctx.classic_target.copy_from_slice(&data_in[..6]);
            Ok(0)
        }
        Request::BtleSetTarget => {
            if data_in.len() < 6 {
                return Err(CommandError::ShortBuffer);
            }
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&data_in[..6]);
            if mac == [0; 6] {
                ctx.link.clear_target();
            } else {
                ctx.link.set_target(mac);
            }
            Ok(0)
        }
        Request::StartHopping => {
            let offset = ((index as u32) << 16 | value as u32) as i32;
            ctx.clock.trim(offset);
            ctx.hop.mode = HopMode::Bluetooth;
            ctx.flags.request_mode(Mode::BtFollow);
            Ok(0)
        }
        Request::Hop => {
            ctx.flags.signal_hop();
            Ok(0)
        }

        // -- clock ----------------------------------------------------------
        Request::SetClock => {
            ctx.clock.set((index as u32) << 16 | value as u32);
            Ok(0)
        }
        Request::GetClock => {
            need(data_out, 4)?;
            data_out[..4].copy_from_slice(&ctx.clock.clkn().to_le_bytes());
            Ok(4)
        }
        Request::TrimClock => {
            ctx.clock.trim(((index as u32) << 16 | value as u32) as i32);
            Ok(0)
        }

        // -- AFH map --------------------------------------------------------
        Request::SetAfhMap => {
            if data_in.len() < 10 {
                return Err(CommandError::ShortBuffer);
            }
            let mut map = [0u8; 10];
            map.copy_from_slice(&data_in[..10]);
            ctx.hop.set_afh_map(map);
            Ok(0)
        }
        Request::ClearAfhMap => {
            ctx.hop.clear_afh_map();
            Ok(0)
        }

        // -- LE link parameters ---------------------------------------------
        Request::GetAccessAddress => {
            need(data_out, 4)?;
            data_out[..4].copy_from_slice(&ctx.link.access_address.to_le_bytes());
            Ok(4)
        }
        Request::SetAccessAddress => {
            ctx.link
                .set_access_address((index as u32) << 16 | value as u32);
            Ok(0)
        }
        Request::GetCrcVerify => {
            need(data_out, 1)?;
            data_out[0] = ctx.link.crc_verify as u8;
            Ok(1)
        }
        Request::SetCrcVerify => {
            ctx.link.crc_verify = value != 0;
            Ok(0)
        }

        // -- register access ------------------------------------------------
        Request::ReadRegister => {
            need(data_out, 2)?;
            let v = radio.read_register(index as u8);
            data_out[..2].copy_from_slice(&v.to_le_bytes());
            Ok(2)
        }
        Request::WriteRegister => {
            radio.write_register(index as u8, value);
            Ok(0)
        }
        Request::WriteRegisters => {
            // Triples of (address, value LE).
            if data_in.is_empty() || data_in.len() % 3 != 0 {
                return Err(CommandError::InvalidArgument);
            }
            for chunk in data_in.chunks_exact(3) {
                radio.write_register(chunk[0], u16::from_le_bytes([chunk[1], chunk[2]]));
            }
            Ok(0)
        }
        Request::ReadAllRegisters => {
            let len = REGISTER_COUNT as usize * 3;
            need(data_out, len)?;
            for addr in 0..REGISTER_COUNT {
                let v = radio.read_register(addr);
                let at = addr as usize * 3;
                data_out[at] = addr;
                data_out[at + 1..at + 3].copy_from_slice(&v.to_le_bytes());
            }
            Ok(len)
        }

        // -- jamming and output ---------------------------------------------
        Request::JamMode => {
            ctx.jam.mode = match value {
                0 => JamMode::None,
                1 => JamMode::Once,
                2 => JamMode::Continuous,
                _ => return Err(CommandError::InvalidArgument),
            };
            if ctx.jam.mode == JamMode::None {
                ctx.jam.count = 0;
            }
            Ok(0)
        }
        Request::Poll => {
            match ctx.queue.pop() {
                Some(rec) => {
                    need(data_out, RECORD_LEN)?;
                    Ok(serialize_record(&rec, data_out))
                }
                None => {
                    need(data_out, 1)?;
                    data_out[0] = 0;
                    Ok(1)
                }
            }
        }
        Request::Flash => {
            radio.reset_device(true);
            Ok(0)
        }
    }
}
