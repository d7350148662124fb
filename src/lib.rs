// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod codec;
pub mod component;
pub mod decoder;
pub mod device;
pub mod interface;
pub mod surface_pool;
pub mod task_runner;

use std::fmt;
use std::str::FromStr;

/// A FourCC, as used to identify pixel formats and codecs across the V4L2
/// boundary.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Fourcc(pub u32);

impl Fourcc {
    pub const fn from_bytes(b: &[u8; 4]) -> Self {
        Self(b[0] as u32 | (b[1] as u32) << 8 | (b[2] as u32) << 16 | (b[3] as u32) << 24)
    }
}

impl From<&[u8; 4]> for Fourcc {
    fn from(b: &[u8; 4]) -> Self {
        Self::from_bytes(b)
    }
}

impl From<u32> for Fourcc {
    fn from(code: u32) -> Self {
        Self(code)
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = self.0.to_le_bytes();
        write!(
            f,
            "{}{}{}{}",
            b[0] as char, b[1] as char, b[2] as char, b[3] as char
        )
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Fourcc({})", self)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether `self` can fit a rectangle of size `other`.
    pub fn can_contain(&self, other: Resolution) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(res: Resolution) -> Self {
        (res.width, res.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A crop window within a coded picture.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether `self` lies entirely within a `size`-sized picture anchored at
    /// the origin.
    pub fn is_contained_by(&self, size: Resolution) -> bool {
        self.left >= 0
            && self.top >= 0
            && self.left as u64 + self.width as u64 <= size.width as u64
            && self.top as u64 + self.height as u64 <= size.height as u64
    }
}

impl From<Resolution> for Rect {
    fn from(res: Resolution) -> Self {
        Self {
            left: 0,
            top: 0,
            width: res.width,
            height: res.height,
        }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "({}, {}) {}x{}",
            self.left, self.top, self.width, self.height
        )
    }
}

/// Compressed formats the decode pipeline accepts.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    HEVC,
    VP8,
    VP9,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "H264",
            VideoCodec::HEVC => "HEVC",
            VideoCodec::VP8 => "VP8",
            VideoCodec::VP9 => "VP9",
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VideoCodec {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(VideoCodec::H264),
            "h265" | "hevc" | "HEVC" => Ok(VideoCodec::HEVC),
            "vp8" | "VP8" => Ok(VideoCodec::VP8),
            "vp9" | "VP9" => Ok(VideoCodec::VP9),
            _ => Err("unrecognized codec. Valid values: h264, hevc, vp8, vp9"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trip() {
        let fourcc = Fourcc::from(b"NV12");
        assert_eq!(fourcc.to_string(), "NV12");
        assert_eq!(Fourcc::from(fourcc.0), fourcc);
    }

    #[test]
    fn rect_containment() {
        let coded = Resolution::new(640, 480);
        assert!(Rect { left: 0, top: 0, width: 640, height: 480 }.is_contained_by(coded));
        assert!(Rect { left: 2, top: 2, width: 638, height: 478 }.is_contained_by(coded));
        assert!(!Rect { left: 2, top: 0, width: 640, height: 480 }.is_contained_by(coded));
        assert!(!Rect { left: -1, top: 0, width: 16, height: 16 }.is_contained_by(coded));
        assert!(Rect::default().is_empty());
    }
}
