//! SPL standard message decoding
//!
//! Robots broadcast the RoboCup SPL standard message (struct version 7) to
//! their team. Our robots append a vendor block, marked with `"BB "`, that
//! carries a full localization estimate and ball percept.

use serde::Serialize;
use tracing::warn;

use crate::codec::ByteReader;
use crate::error::DecodeError;

pub const SPL_MAGIC: &[u8; 4] = b"SPL ";
pub const SPL_VERSION: u8 = 7;
/// Fixed part of the message preceding the data section
pub const SPL_HEADER_SIZE: usize = 70;
pub const SPL_DATA_SIZE: usize = 474;
pub const SPL_MAX_PLAYERS: usize = 5;

pub const VENDOR_MAGIC: &[u8; 3] = b"BB ";
pub const MESSAGE_HEADER_SIZE: usize = 20;
pub const TEAM_ROBOT_SIZE: usize = 108;
pub const TEAM_BALL_SIZE: usize = 48;

/// Common header of vendor sub-records
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MessageHeader {
    pub message_type: i32,
    pub sender_hash: u8,
    pub sender: i32,
    pub team_number: i32,
    pub timestamp: i32,
}

impl MessageHeader {
    fn read(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let message_type = r.i32()?;
        let sender_hash = r.u8()?;
        r.skip(3)?;
        Ok(Self {
            message_type,
            sender_hash,
            sender: r.i32()?,
            team_number: r.i32()?,
            timestamp: r.i32()?,
        })
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        Self::read(&mut ByteReader::new(data, "message header"))
    }
}

/// Localization estimate of a teammate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamRobot {
    pub header: MessageHeader,
    pub confidence: f32,
    pub robot_id: i32,
    pub pos_x: f32,
    pub pos_y: f32,
    pub alpha: f32,
    pub gt_pos_x: f32,
    pub gt_pos_y: f32,
    pub gt_alpha: f32,
    pub gt_confidence: f32,
    pub active: bool,
    pub gt_timestamp: i32,
    pub role: i32,
    /// Row-major 3x3 pose covariance
    pub covariance: [[f32; 3]; 3],
    pub fallen_since: i32,
}

impl TeamRobot {
    fn read(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let header = MessageHeader::read(r)?;
        let confidence = r.f32()?;
        let robot_id = r.i32()?;
        let pos_x = r.f32()?;
        let pos_y = r.f32()?;
        let alpha = r.f32()?;
        let gt_pos_x = r.f32()?;
        let gt_pos_y = r.f32()?;
        let gt_alpha = r.f32()?;
        let gt_confidence = r.f32()?;
        let active = r.bool()?;
        r.skip(3)?;
        let gt_timestamp = r.i32()?;
        let role = r.i32()?;
        let flat: [f32; 9] = r.f32_array()?;
        let covariance = [
            [flat[0], flat[1], flat[2]],
            [flat[3], flat[4], flat[5]],
            [flat[6], flat[7], flat[8]],
        ];
        Ok(Self {
            header,
            confidence,
            robot_id,
            pos_x,
            pos_y,
            // NaN angles show up when localization has not converged yet
            alpha: if alpha.is_finite() { alpha } else { 0.0 },
            gt_pos_x,
            gt_pos_y,
            gt_alpha,
            gt_confidence,
            active,
            gt_timestamp,
            role,
            covariance,
            fallen_since: r.i32()?,
        })
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        Self::read(&mut ByteReader::new(data, "team robot"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamBall {
    pub header: MessageHeader,
    pub confidence: f32,
    pub pos_x: f32,
    pub pos_y: f32,
    pub motion_x: f32,
    pub motion_y: f32,
    pub motion_confidence: f32,
    pub local_confidence: f32,
}

impl TeamBall {
    fn read(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            header: MessageHeader::read(r)?,
            confidence: r.f32()?,
            pos_x: r.f32()?,
            pos_y: r.f32()?,
            motion_x: r.f32()?,
            motion_y: r.f32()?,
            motion_confidence: r.f32()?,
            local_confidence: r.f32()?,
        })
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        Self::read(&mut ByteReader::new(data, "team ball"))
    }
}

/// Vendor extension carried in the data section
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VendorBlock {
    pub robot: TeamRobot,
    pub ball: TeamBall,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplStandardMessage {
    pub version: u8,
    pub player_num: i8,
    pub team_num: i8,
    pub fallen: i8,
    /// x, y in mm and orientation in rad
    pub pose: [f32; 3],
    pub walking_to: [f32; 2],
    pub shooting_to: [f32; 2],
    /// Seconds since the ball was last seen, -1 if never
    pub ball_age: f32,
    pub ball: [f32; 2],
    pub ball_velocity: [f32; 2],
    pub suggestion: [i8; SPL_MAX_PLAYERS],
    pub intention: i8,
    pub average_walk_speed: i16,
    pub max_kick_distance: i16,
    pub current_position_confidence: i8,
    pub current_side_confidence: i8,
    pub data: Vec<u8>,
    pub vendor: Option<VendorBlock>,
}

impl SplStandardMessage {
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        const WHAT: &str = "SPL standard message";
        let mut r = ByteReader::new(data, WHAT);

        if r.array::<4>()? != *SPL_MAGIC {
            return Err(DecodeError::BadMagic { what: WHAT });
        }
        let version = r.u8()?;
        if version != SPL_VERSION {
            return Err(DecodeError::UnsupportedVersion {
                what: WHAT,
                expected: SPL_VERSION,
                found: version,
            });
        }

        let player_num = r.i8()?;
        let team_num = r.i8()?;
        let fallen = r.i8()?;
        let pose = r.f32_array()?;
        let walking_to = r.f32_array()?;
        let shooting_to = r.f32_array()?;
        let ball_age = r.f32()?;
        let ball = r.f32_array()?;
        let ball_velocity = r.f32_array()?;
        let mut suggestion = [0i8; SPL_MAX_PLAYERS];
        for s in suggestion.iter_mut() {
            *s = r.i8()?;
        }
        let intention = r.i8()?;
        let average_walk_speed = r.i16()?;
        let max_kick_distance = r.i16()?;
        let current_position_confidence = r.i8()?;
        let current_side_confidence = r.i8()?;
        let num_data_bytes = r.u16()? as usize;

        if num_data_bytes > SPL_DATA_SIZE {
            return Err(DecodeError::Invalid(format!(
                "{}: {} data bytes declared, at most {} allowed",
                WHAT, num_data_bytes, SPL_DATA_SIZE
            )));
        }
        if num_data_bytes > r.remaining() {
            return Err(DecodeError::Invalid(format!(
                "{}: {} data bytes declared, {} present",
                WHAT,
                num_data_bytes,
                r.remaining()
            )));
        }
        let data = r.bytes(num_data_bytes)?.to_vec();
        let vendor = decode_vendor_block(&data);

        Ok(Self {
            version,
            player_num,
            team_num,
            fallen,
            pose,
            walking_to,
            shooting_to,
            ball_age,
            ball,
            ball_velocity,
            suggestion,
            intention,
            average_walk_speed,
            max_kick_distance,
            current_position_confidence,
            current_side_confidence,
            data,
            vendor,
        })
    }

    pub fn is_fallen(&self) -> bool {
        self.fallen != 0
    }
}

/// A malformed vendor block does not invalidate the standard part
fn decode_vendor_block(data: &[u8]) -> Option<VendorBlock> {
    if data.len() <= VENDOR_MAGIC.len() || !data.starts_with(VENDOR_MAGIC) {
        return None;
    }
    let mut r = ByteReader::new(&data[VENDOR_MAGIC.len()..], "SPL vendor block");
    let block = TeamRobot::read(&mut r).and_then(|robot| {
        let ball = TeamBall::read(&mut r)?;
        Ok(VendorBlock { robot, ball })
    });
    match block {
        Ok(block) => Some(block),
        Err(e) => {
            warn!("Ignoring malformed vendor block: {}", e);
            None
        }
    }
}
