// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Minimal bitstream peeking for the decode pipeline.
//!
//! The hardware performs the actual decoding; this module only walks NAL
//! units to locate SPS/IDR units and to extract VUI color aspects, plus the
//! one-byte keyframe checks for VP8/VP9 uncompressed headers.

pub mod h264;
pub mod h265;
pub mod nalu;
pub mod nalu_reader;

use thiserror::Error;

use crate::VideoCodec;

/// Color aspect indices of a coded stream, as carried in an SPS VUI. The
/// numeric values follow the VUI tables of the respective codec specs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorAspects {
    pub primaries: u32,
    pub transfer: u32,
    pub matrix: u32,
    pub full_range: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The bit reader ran off the end of the buffer.
    #[error("not enough data to parse the stream")]
    InsufficientData,
    /// A syntax element was out of its permitted range.
    #[error("malformed stream: {0}")]
    MalformedStream(&'static str),
}

pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// Whether the first byte of a VP8 uncompressed header describes a keyframe.
/// The frame type occupies bit 0; zero means keyframe.
pub fn vp8_is_keyframe(data: &[u8]) -> bool {
    const VP8_FRAME_TYPE_MASK: u8 = 0x1;
    data.first().is_some_and(|b| b & VP8_FRAME_TYPE_MASK == 0)
}

/// Whether the first byte of a VP9 uncompressed header describes a keyframe.
/// The frame type occupies bit 2; zero means keyframe.
pub fn vp9_is_keyframe(data: &[u8]) -> bool {
    const VP9_FRAME_TYPE_MASK: u8 = 0x4;
    data.first().is_some_and(|b| b & VP9_FRAME_TYPE_MASK == 0)
}

/// Whether `data` contains a unit that permits decoding to start: an IDR NAL
/// for H.264/HEVC, a keyframe header for VP8/VP9. VP8 and VP9 buffers are
/// assumed to hold a single unfragmented frame.
pub fn contains_keyframe(codec: VideoCodec, data: &[u8]) -> bool {
    match codec {
        VideoCodec::H264 => nalu::NaluWalker::h264(data).locate_idr(),
        VideoCodec::HEVC => nalu::NaluWalker::hevc(data).locate_idr(),
        VideoCodec::VP8 => vp8_is_keyframe(data),
        VideoCodec::VP9 => vp9_is_keyframe(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vp8_keyframe_bit() {
        // 0x9d is an interframe tag (bit 0 set), 0x10 a keyframe tag.
        assert!(vp8_is_keyframe(&[0x10, 0x00]));
        assert!(!vp8_is_keyframe(&[0x9d, 0x01]));
        assert!(!vp8_is_keyframe(&[]));
    }

    #[test]
    fn vp9_keyframe_bit() {
        // Bit 2 clear marks a keyframe.
        assert!(vp9_is_keyframe(&[0x82]));
        assert!(!vp9_is_keyframe(&[0x86]));
        assert!(!vp9_is_keyframe(&[]));
    }

    #[test]
    fn keyframe_predicate_dispatch() {
        // An H.264 IDR slice behind a 4-byte start code.
        let idr = [0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84];
        assert!(contains_keyframe(VideoCodec::H264, &idr));
        // The same bytes are not an HEVC IDR_W_RADL unit.
        assert!(!contains_keyframe(VideoCodec::HEVC, &idr));
        assert!(contains_keyframe(VideoCodec::VP9, &[0x82]));
    }
}
