//! Wire codec for Pro DJ Link UDP packets.
//!
//! Every packet starts with a 10-byte magic header, a packet-type byte at
//! 0x0a, and a 20-byte zero-padded device name. Multi-byte integers are
//! big-endian. Outgoing beat and status packets are built by overlaying
//! fields onto payload templates captured from real hardware; the template
//! bytes themselves must not change.

use std::net::Ipv4Addr;

use anyhow::anyhow;
use byteorder::{BigEndian, ByteOrder};
use nom::{
    bytes::complete::{tag, take},
    number::complete::{be_u16, be_u24, be_u32, be_u8},
    IResult,
};
use nom_locate::LocatedSpan;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use pretty_hex::pretty_hex;

use crate::message::{BeatInfo, StatusInfo};
use crate::{ProlinkError, Result};

type Span<'a> = LocatedSpan<&'a [u8]>;

pub(crate) const HEADER: &[u8] = &[0x51, 0x73, 0x70, 0x74, 0x31, 0x57, 0x6d, 0x4a, 0x4f, 0x4c];

pub(crate) const DEVICE_NAME_LEN: usize = 20;
pub(crate) const PACKET_TYPE_OFFSET: usize = 0x0a;
const DEVICE_NAME_OFFSET: usize = 0x0b;
const PAYLOAD_OFFSET: usize = 0x1f;

const BEAT_PACKET_SIZE: usize = 0x60;
const STATUS_MIN_SIZE: usize = 0xc8;
const KEEP_ALIVE_PACKET_SIZE: usize = 0x36;
const CONTROL_MIN_SIZE: usize = 0x2c;
const HANDOFF_REQUEST_MIN_SIZE: usize = 0x22;

const STATUS_FLAG_MASTER: u8 = 0x20;
const STATUS_FLAG_SYNCED: u8 = 0x10;
const STATUS_FLAG_PLAYING: u8 = 0x40;

const NO_BPM: u16 = 0xffff;
const NO_BEAT: u32 = 0xffff_ffff;

// Payload field offsets, relative to the payload start at 0x1f.
const BEAT_DEVICE_NUMBER: usize = 0x02;
const BEAT_NEXT_BEAT: usize = 0x05;
const BEAT_SECOND_BEAT: usize = 0x09;
const BEAT_NEXT_BAR: usize = 0x0d;
const BEAT_FOURTH_BEAT: usize = 0x11;
const BEAT_SECOND_BAR: usize = 0x15;
const BEAT_EIGHTH_BEAT: usize = 0x19;
const BEAT_PITCH: usize = 0x36;
const BEAT_BPM: usize = 0x3b;
const BEAT_WITHIN_BAR: usize = 0x3d;
const BEAT_DEVICE_NUMBER_2: usize = 0x40;

const STATUS_DEVICE_NUMBER: usize = 0x02;
const STATUS_DEVICE_NUMBER_2: usize = 0x05;
const STATUS_PLAYING_FLAG: usize = 0x08;
const STATUS_DEVICE_NUMBER_3: usize = 0x09;
const STATUS_PLAY_MODE: usize = 0x5c;
const STATUS_FLAGS: usize = 0x6a;
const STATUS_PLAY_STATE: usize = 0x6c;
const STATUS_PITCH: usize = 0x6e;
const STATUS_BPM: usize = 0x73;
const STATUS_PLAY_STATE_2: usize = 0x7e;
const STATUS_MASTER_FLAG: usize = 0x7f;
const STATUS_MASTER_HANDOFF: usize = 0x80;
const STATUS_BEAT_NUMBER: usize = 0x81;
const STATUS_BEAT_WITHIN_BAR: usize = 0x87;
const STATUS_PACKET_COUNTER: usize = 0xa9;

const CONTROL_DEVICE_NUMBER: usize = 0x02;
const CONTROL_SENDER: usize = 0x08;
const CONTROL_COMMAND: usize = 0x0c;
const CONTROL_PAYLOAD_SIZE: usize = 0x0d;
const HANDOFF_REQUEST_PAYLOAD_SIZE: usize = 0x09;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub(crate) enum PacketType {
    KeepAlive = 0x06,
    CdjStatus = 0x0a,
    MasterHandoffRequest = 0x26,
    MasterHandoffResponse = 0x27,
    Beat = 0x28,
    SyncControl = 0x2a,
}

// Beat payload captured from real hardware. Fields at the offsets above are
// overwritten before sending.
const BEAT_PAYLOAD_TEMPLATE: [u8; 0x41] = [
    0x01, 0x00, 0x0d, 0x00, 0x3c, 0x01, 0x01, 0x01, 0x01, 0x02, 0x02, 0x02, //
    0x02, 0x10, 0x10, 0x10, 0x10, 0x04, 0x04, 0x04, 0x04, 0x20, 0x20, 0x20, //
    0x20, 0x08, 0x08, 0x08, 0x08, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
    0xff, 0xff, 0xff, 0xff, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x0b, 0x00, 0x00, 0x0d, 0x00,
];

// CDJ status payload captured from real hardware. Fields at the offsets
// above are overwritten before sending.
const STATUS_PAYLOAD_TEMPLATE: [u8; 0x120] = [
    0x01, 0x04, 0x00, 0x00, 0xf8, 0x00, 0x00, 0x01, 0x00, 0x00, 0x03, 0x01, //
    0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0xa0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x04, 0x04, 0x00, 0x00, 0x00, 0x04, //
    0x00, 0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x31, 0x2e, 0x34, 0x33, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0xff, 0x00, 0x00, 0x10, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, //
    0x7f, 0xff, 0xff, 0xff, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x01, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, //
    0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0f, 0x01, 0x00, 0x00, //
    0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0x00, 0x01, 0x01, 0x01, 0x01, 0x01, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x15, 0x00, 0x00, 0x07, 0x61, 0x00, 0x00, 0x06, 0x2f,
];

pub(crate) fn has_header(data: &[u8]) -> bool {
    data.len() >= HEADER.len() && &data[..HEADER.len()] == HEADER
}

/// Trim a raw name field: cut at the first NUL, drop trailing spaces.
fn trimmed_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let name = String::from_utf8_lossy(&raw[..end]);
    name.trim_end_matches(' ').to_string()
}

fn padded_name(name: &str) -> [u8; DEVICE_NAME_LEN] {
    let mut buf = [0u8; DEVICE_NAME_LEN];
    let len = name.len().min(DEVICE_NAME_LEN);
    buf[..len].copy_from_slice(&name.as_bytes()[..len]);
    buf
}

fn header(i: Span) -> IResult<Span, ()> {
    let (i, _) = tag(HEADER)(i)?;
    Ok((i, ()))
}

fn device_name(i: Span) -> IResult<Span, String> {
    let (i, raw) = take(DEVICE_NAME_LEN)(i)?;
    Ok((i, trimmed_name(raw.fragment())))
}

fn mac_addr(i: Span) -> IResult<Span, [u8; 6]> {
    let (i, raw) = take(6usize)(i)?;
    let mut mac = [0u8; 6];
    mac.copy_from_slice(raw.fragment());
    Ok((i, mac))
}

fn ip_addr(i: Span) -> IResult<Span, Ipv4Addr> {
    let (i, raw) = take(4usize)(i)?;
    let octets = raw.fragment();
    Ok((i, Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3])))
}

fn normalize_beat_within_bar(beat_within_bar: u8) -> u8 {
    if (1..=8).contains(&beat_within_bar) {
        beat_within_bar
    } else {
        1
    }
}

/// Assemble header + type byte + padded name + payload into one packet.
fn assemble(packet_type: PacketType, device_name: &str, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(PAYLOAD_OFFSET + payload.len());
    packet.extend_from_slice(HEADER);
    packet.push(packet_type as u8);
    packet.extend_from_slice(&padded_name(device_name));
    packet.extend_from_slice(payload);
    packet
}

/// Build a beat packet. The 2x/4x/8x interval fields and second-bar field
/// are derived from `next_beat_ms` and `next_bar_ms`.
pub(crate) fn build_beat(info: &BeatInfo) -> Vec<u8> {
    let mut payload = BEAT_PAYLOAD_TEMPLATE.to_vec();
    payload[BEAT_DEVICE_NUMBER] = info.device_number;
    payload[BEAT_DEVICE_NUMBER_2] = info.device_number;
    let interval = info.next_beat_ms;
    BigEndian::write_u32(&mut payload[BEAT_NEXT_BEAT..], interval);
    BigEndian::write_u32(&mut payload[BEAT_SECOND_BEAT..], interval.saturating_mul(2));
    BigEndian::write_u32(&mut payload[BEAT_FOURTH_BEAT..], interval.saturating_mul(4));
    BigEndian::write_u32(&mut payload[BEAT_EIGHTH_BEAT..], interval.saturating_mul(8));
    BigEndian::write_u32(&mut payload[BEAT_NEXT_BAR..], info.next_bar_ms);
    BigEndian::write_u32(
        &mut payload[BEAT_SECOND_BAR..],
        info.next_bar_ms.saturating_add(interval.saturating_mul(4)),
    );
    BigEndian::write_u24(&mut payload[BEAT_PITCH..], info.pitch);
    BigEndian::write_u16(&mut payload[BEAT_BPM..], info.bpm.min(NO_BPM as u32) as u16);
    payload[BEAT_WITHIN_BAR] = info.beat_within_bar;
    assemble(PacketType::Beat, &info.device_name, &payload)
}

fn parse_beat(data: Span) -> IResult<Span, Packet> {
    let (i, _) = header(data)?;
    let (i, _) = tag(&[PacketType::Beat as u8][..])(i)?;
    let (i, device_name) = device_name(i)?;
    let (i, _) = take(2usize)(i)?;
    let (i, device_number) = be_u8(i)?;
    let (i, _pkt_len) = be_u16(i)?;
    let (i, next_beat_ms) = be_u32(i)?;
    let (i, _second_beat) = be_u32(i)?;
    let (i, next_bar_ms) = be_u32(i)?;
    let (i, _) = take(0x25usize)(i)?;
    let (i, pitch) = be_u24(i)?;
    let (i, _) = take(2usize)(i)?;
    let (i, bpm) = be_u16(i)?;
    let (i, beat_within_bar) = be_u8(i)?;
    Ok((
        i,
        Packet::Beat(BeatInfo {
            device_number,
            device_name,
            bpm: bpm as u32,
            pitch,
            beat_within_bar: normalize_beat_within_bar(beat_within_bar),
            next_beat_ms,
            next_bar_ms,
        }),
    ))
}

/// Build a CDJ status packet; `packet_counter` lands in the opaque trailing
/// sequence field.
pub(crate) fn build_status(info: &StatusInfo, packet_counter: u32) -> Vec<u8> {
    let mut payload = STATUS_PAYLOAD_TEMPLATE.to_vec();
    payload[STATUS_DEVICE_NUMBER] = info.device_number;
    payload[STATUS_DEVICE_NUMBER_2] = info.device_number;
    payload[STATUS_DEVICE_NUMBER_3] = info.device_number;
    payload[STATUS_PLAYING_FLAG] = info.is_playing as u8;
    payload[STATUS_PLAY_MODE] = if info.is_playing { 3 } else { 5 };
    payload[STATUS_FLAGS] = 0x84
        | if info.is_playing { STATUS_FLAG_PLAYING } else { 0 }
        | if info.is_master { STATUS_FLAG_MASTER } else { 0 }
        | if info.is_synced { STATUS_FLAG_SYNCED } else { 0 };
    payload[STATUS_PLAY_STATE] = if info.is_playing { 0x7a } else { 0x7e };
    payload[STATUS_PLAY_STATE_2] = if info.is_playing { 9 } else { 1 };
    payload[STATUS_MASTER_FLAG] = info.is_master as u8;
    payload[STATUS_MASTER_HANDOFF] = info.master_handoff_to;
    BigEndian::write_u24(&mut payload[STATUS_PITCH..], info.pitch);
    BigEndian::write_u16(
        &mut payload[STATUS_BPM..],
        info.bpm.map_or(NO_BPM, |bpm| bpm.min(NO_BPM as u32) as u16),
    );
    BigEndian::write_u32(&mut payload[STATUS_BEAT_NUMBER..], info.beat.unwrap_or(NO_BEAT));
    payload[STATUS_BEAT_WITHIN_BAR] = info.beat_within_bar;
    BigEndian::write_u32(&mut payload[STATUS_PACKET_COUNTER..], packet_counter);
    assemble(PacketType::CdjStatus, &info.device_name, &payload)
}

fn parse_status(data: Span) -> IResult<Span, Packet> {
    let (i, _) = header(data)?;
    let (i, _) = tag(&[PacketType::CdjStatus as u8][..])(i)?;
    let (i, device_name) = device_name(i)?;
    let (i, _) = take(2usize)(i)?;
    let (i, device_number) = be_u8(i)?;
    let (i, _) = take(0x67usize)(i)?;
    let (i, flags) = be_u8(i)?;
    let (i, _) = take(3usize)(i)?;
    let (i, pitch) = be_u24(i)?;
    let (i, _) = take(2usize)(i)?;
    let (i, raw_bpm) = be_u16(i)?;
    let (i, _) = take(0x0busize)(i)?;
    let (i, master_handoff_to) = be_u8(i)?;
    let (i, raw_beat) = be_u32(i)?;
    let (i, _) = take(2usize)(i)?;
    let (i, beat_within_bar) = be_u8(i)?;
    Ok((
        i,
        Packet::Status(StatusInfo {
            device_number,
            device_name,
            bpm: (raw_bpm != NO_BPM).then_some(raw_bpm as u32),
            pitch,
            beat: (raw_beat != NO_BEAT).then_some(raw_beat),
            beat_within_bar: normalize_beat_within_bar(beat_within_bar),
            master_handoff_to,
            is_master: flags & STATUS_FLAG_MASTER != 0,
            is_synced: flags & STATUS_FLAG_SYNCED != 0,
            is_playing: flags & STATUS_FLAG_PLAYING != 0,
        }),
    ))
}

/// Keep-alive (announce) packet on port 50000.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct KeepAlive {
    pub device_name: String,
    pub device_number: u8,
    pub device_type: u8,
    pub mac_address: [u8; 6],
    pub ip_address: Ipv4Addr,
}

impl KeepAlive {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(KEEP_ALIVE_PACKET_SIZE);
        packet.extend_from_slice(HEADER);
        packet.push(PacketType::KeepAlive as u8);
        packet.push(0x00);
        packet.extend_from_slice(&padded_name(&self.device_name));
        packet.extend_from_slice(&[0x01, 0x02, 0x00, KEEP_ALIVE_PACKET_SIZE as u8]);
        packet.push(self.device_number);
        packet.push(self.device_type);
        packet.extend_from_slice(&self.mac_address);
        packet.extend_from_slice(&self.ip_address.octets());
        packet.extend_from_slice(&[0x01, 0x00, 0x00, 0x00, self.device_type, 0x00]);
        packet
    }

    fn parse(data: Span) -> IResult<Span, Packet> {
        let (i, _) = header(data)?;
        let (i, _) = tag(&[PacketType::KeepAlive as u8][..])(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = take(5usize)(i)?;
        let (i, device_number) = be_u8(i)?;
        let (i, device_type) = be_u8(i)?;
        let (i, mac_address) = mac_addr(i)?;
        let (i, ip_address) = ip_addr(i)?;
        // Announcing hardware pads the byte after the packet type, shifting
        // the name field by one; retry there when the primary slot is empty.
        let device_name = if name.is_empty() {
            let raw = data.fragment();
            trimmed_name(&raw[DEVICE_NAME_OFFSET + 1..DEVICE_NAME_OFFSET + 1 + DEVICE_NAME_LEN])
        } else {
            name
        };
        Ok((
            i,
            Packet::KeepAlive(KeepAlive {
                device_name,
                device_number,
                device_type,
                mac_address,
                ip_address,
            }),
        ))
    }
}

/// Sync control packet on port 50001 (type 0x2a).
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SyncControl {
    pub device_name: String,
    pub device_number: u8,
    pub command: u8,
}

impl SyncControl {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = [0u8; CONTROL_PAYLOAD_SIZE];
        payload[0x00] = 0x01;
        payload[CONTROL_DEVICE_NUMBER] = self.device_number;
        payload[0x04] = 0x08;
        payload[CONTROL_SENDER] = self.device_number;
        payload[CONTROL_COMMAND] = self.command;
        assemble(PacketType::SyncControl, &self.device_name, &payload)
    }

    fn parse(data: Span) -> IResult<Span, Packet> {
        let (i, _) = header(data)?;
        let (i, _) = tag(&[PacketType::SyncControl as u8][..])(i)?;
        let (i, device_name) = device_name(i)?;
        let (i, _) = take(2usize)(i)?;
        let (i, device_number) = be_u8(i)?;
        let (i, _) = take(9usize)(i)?;
        let (i, command) = be_u8(i)?;
        Ok((
            i,
            Packet::SyncControl(SyncControl {
                device_name,
                device_number,
                command,
            }),
        ))
    }
}

/// Master handoff request packet on port 50001 (type 0x26).
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct MasterHandoffRequest {
    pub device_name: String,
    pub device_number: u8,
}

impl MasterHandoffRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = [0u8; HANDOFF_REQUEST_PAYLOAD_SIZE];
        payload[0x00] = 0x01;
        payload[CONTROL_DEVICE_NUMBER] = self.device_number;
        payload[0x04] = 0x04;
        payload[CONTROL_SENDER] = self.device_number;
        assemble(PacketType::MasterHandoffRequest, &self.device_name, &payload)
    }

    fn parse(data: Span) -> IResult<Span, Packet> {
        let (i, _) = header(data)?;
        let (i, _) = tag(&[PacketType::MasterHandoffRequest as u8][..])(i)?;
        let (i, device_name) = device_name(i)?;
        let (i, _) = take(2usize)(i)?;
        let (i, device_number) = be_u8(i)?;
        Ok((
            i,
            Packet::MasterHandoffRequest(MasterHandoffRequest {
                device_name,
                device_number,
            }),
        ))
    }
}

/// Master handoff response packet on port 50001 (type 0x27).
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct MasterHandoffResponse {
    pub device_name: String,
    pub device_number: u8,
    pub accepted: bool,
}

impl MasterHandoffResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = [0u8; CONTROL_PAYLOAD_SIZE];
        payload[0x00] = 0x01;
        payload[CONTROL_DEVICE_NUMBER] = self.device_number;
        payload[0x04] = 0x08;
        payload[CONTROL_SENDER] = self.device_number;
        payload[CONTROL_COMMAND] = self.accepted as u8;
        assemble(PacketType::MasterHandoffResponse, &self.device_name, &payload)
    }

    fn parse(data: Span) -> IResult<Span, Packet> {
        let (i, _) = header(data)?;
        let (i, _) = tag(&[PacketType::MasterHandoffResponse as u8][..])(i)?;
        let (i, device_name) = device_name(i)?;
        let (i, _) = take(2usize)(i)?;
        let (i, device_number) = be_u8(i)?;
        let (i, _) = take(9usize)(i)?;
        let (i, accepted) = be_u8(i)?;
        Ok((
            i,
            Packet::MasterHandoffResponse(MasterHandoffResponse {
                device_name,
                device_number,
                accepted: accepted == 0x01,
            }),
        ))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Packet {
    KeepAlive(KeepAlive),
    Beat(BeatInfo),
    Status(StatusInfo),
    SyncControl(SyncControl),
    MasterHandoffRequest(MasterHandoffRequest),
    MasterHandoffResponse(MasterHandoffResponse),
}

impl Packet {
    fn parse_impl(data: Span) -> IResult<Span, Packet> {
        let (i, _) = header(data)?;
        let (i, packet_type) = be_u8(i)?;
        let len = data.fragment().len();

        match FromPrimitive::from_u8(packet_type) {
            Some(PacketType::KeepAlive) if len >= KEEP_ALIVE_PACKET_SIZE => KeepAlive::parse(data),
            Some(PacketType::Beat) if len >= BEAT_PACKET_SIZE => parse_beat(data),
            Some(PacketType::CdjStatus) if len >= STATUS_MIN_SIZE => parse_status(data),
            Some(PacketType::SyncControl) if len >= CONTROL_MIN_SIZE => SyncControl::parse(data),
            Some(PacketType::MasterHandoffRequest) if len >= HANDOFF_REQUEST_MIN_SIZE => {
                MasterHandoffRequest::parse(data)
            }
            Some(PacketType::MasterHandoffResponse) if len >= CONTROL_MIN_SIZE => {
                MasterHandoffResponse::parse(data)
            }
            Some(_) => Err(nom::Err::Error(nom::error::Error::new(
                i,
                nom::error::ErrorKind::Eof,
            ))),
            None => Err(nom::Err::Error(nom::error::Error::new(
                i,
                nom::error::ErrorKind::Tag,
            ))),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Packet> {
        match Self::parse_impl(Span::new(data)) {
            Ok((_, packet)) => Ok(packet),
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(ProlinkError::Parse {
                error_kind: format!("{:?}", e.code),
                pos: e.input.location_offset(),
                dump: pretty_hex(&data),
            }),
            Err(e) => Err(anyhow!("error parsing packet: {}", e).into()),
        }
    }
}
