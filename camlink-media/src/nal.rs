//! H.264 Annex B bitstream helpers
//!
//! Frames arrive as Annex B byte streams: NAL units separated by `00 00 01` or
//! `00 00 00 01` start codes.

use crate::error::{MediaError, MediaResult};

/// Coded slice of a non-IDR picture
pub const NAL_SLICE: u8 = 1;
/// Coded slice of an IDR picture
pub const NAL_IDR: u8 = 5;
/// Supplemental enhancement information
pub const NAL_SEI: u8 = 6;
/// Sequence parameter set
pub const NAL_SPS: u8 = 7;
/// Picture parameter set
pub const NAL_PPS: u8 = 8;
/// Access unit delimiter
pub const NAL_AUD: u8 = 9;

/// NAL unit type of a unit without its start code
pub fn nal_unit_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1f)
}

/// Whether `data` begins with an Annex B start code
pub fn has_start_code(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 1]) || data.starts_with(&[0, 0, 0, 1])
}

/// Iterate over the NAL units of an Annex B stream, start codes removed
pub fn nal_units(data: &[u8]) -> NalUnits<'_> {
    NalUnits {
        data,
        pos: next_start(data, 0).map_or(data.len(), |(_, payload)| payload),
    }
}

/// Iterator returned by [`nal_units`]
#[derive(Debug, Clone)]
pub struct NalUnits<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.data.len() {
            let start = self.pos;
            let (end, next) = match next_start(self.data, start) {
                Some((code, payload)) => (code, payload),
                None => (self.data.len(), self.data.len()),
            };
            self.pos = next;
            // trailing_zero_8bits may precede the next start code
            let mut unit = &self.data[start..end];
            while let [rest @ .., 0] = unit {
                unit = rest;
            }
            if !unit.is_empty() {
                return Some(unit);
            }
        }
        None
    }
}

/// Find the next start code at or after `from`; returns (code offset, payload offset)
fn next_start(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            return Some((i, i + 3));
        }
        i += 1;
    }
    None
}

/// NAL unit types present in an Annex B stream
pub fn unit_types(data: &[u8]) -> Vec<u8> {
    nal_units(data).filter_map(nal_unit_type).collect()
}

/// Whether the stream carries an IDR slice
pub fn contains_idr(data: &[u8]) -> bool {
    nal_units(data).any(|nal| nal_unit_type(nal) == Some(NAL_IDR))
}

/// Check that configuration data carries both SPS and PPS
pub fn validate_config(data: &[u8]) -> MediaResult<()> {
    if !has_start_code(data) {
        return Err(MediaError::InvalidConfigData {
            reason: "missing Annex B start code".to_string(),
        });
    }
    let types = unit_types(data);
    let missing: Vec<&str> = [(NAL_SPS, "SPS"), (NAL_PPS, "PPS")]
        .iter()
        .filter(|(t, _)| !types.contains(t))
        .map(|(_, name)| *name)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(MediaError::InvalidConfigData {
            reason: format!("missing {}", missing.join(" and ")),
        })
    }
}
