// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode capabilities and configuration parameters.
//!
//! A passive object computed at component creation: codec identity,
//! profile/level lists queried from the device (with codec defaults when the
//! query is unsupported), sizing policies and color aspects.

use enumn::N;

use v4l2r::bindings;
use v4l2r::ioctl;
use v4l2r::ioctl::CtrlId;
use v4l2r::ioctl::QueryCtrlFlags;

use crate::codec;
use crate::device::codec_to_pixel_format;
use crate::device::VideoDevice;
use crate::Resolution;
use crate::VideoCodec;

const K_1080P_AREA: usize = 1920 * 1088;
const K_4K_AREA: usize = 3840 * 2160;

/// Input bitstream buffer size for up to 1080p streams.
#[cfg(not(feature = "large-input-buffers"))]
const INPUT_BUFFER_SIZE_FOR_1080P: usize = 1024 * 1024; // 1MB
#[cfg(feature = "large-input-buffers")]
const INPUT_BUFFER_SIZE_FOR_1080P: usize = 2 * 1024 * 1024; // 2MB

/// Input bitstream buffer size for up to 4k streams.
const INPUT_BUFFER_SIZE_FOR_4K: usize = 4 * INPUT_BUFFER_SIZE_FOR_1080P;

fn calculate_input_buffer_size(area: usize) -> usize {
    if area > K_4K_AREA {
        log::warn!("input buffer size for video area {area} larger than 4K might be too small");
    }

    // Enlarge the input buffer for 4k video.
    if area > K_1080P_AREA {
        INPUT_BUFFER_SIZE_FOR_4K
    } else {
        INPUT_BUFFER_SIZE_FOR_1080P
    }
}

/// Color range of a stream, with the reserved sentinels of the
/// parameter surface.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ColorRange {
    #[default]
    Unspecified = 0,
    Full = 1,
    Limited = 2,
    Other = 0xff,
}

/// Color primaries, coded as the VUI colour_primaries indices.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ColorPrimaries {
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Bt470m = 4,
    Bt470bg = 5,
    Smpte170m = 6,
    Smpte240m = 7,
    GenericFilm = 8,
    Bt2020 = 9,
    Smpte428 = 10,
    Smpte431 = 11,
    Smpte432 = 12,
    Ebu3213 = 22,
    Other = 0xff,
}

/// Transfer characteristics, coded as the VUI transfer_characteristics
/// indices.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ColorTransfer {
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Gamma22 = 4,
    Gamma28 = 5,
    Smpte170m = 6,
    Smpte240m = 7,
    Linear = 8,
    Log100 = 9,
    Log316 = 10,
    Iec61966_2_4 = 11,
    Bt1361 = 12,
    Srgb = 13,
    Bt2020_10bit = 14,
    Bt2020_12bit = 15,
    Smpte2084 = 16,
    Smpte428 = 17,
    Hlg = 18,
    Other = 0xff,
}

/// Matrix coefficients, coded as the VUI matrix_coeffs indices.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ColorMatrix {
    Rgb = 0,
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Fcc = 4,
    Bt470bg = 5,
    Smpte170m = 6,
    Smpte240m = 7,
    YCgCo = 8,
    Bt2020Ncl = 9,
    Bt2020Cl = 10,
    Smpte2085 = 11,
    Other = 0xff,
}

/// The four color aspect fields carried through the parameter surface.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorAspects {
    pub range: ColorRange,
    pub primaries: ColorPrimaries,
    pub transfer: ColorTransfer,
    pub matrix: ColorMatrix,
}

impl ColorAspects {
    /// Translate the raw VUI indices extracted by the NAL parsers.
    pub fn from_coded(coded: codec::ColorAspects) -> Self {
        Self {
            range: if coded.full_range {
                ColorRange::Full
            } else {
                ColorRange::Limited
            },
            primaries: ColorPrimaries::n(coded.primaries).unwrap_or(ColorPrimaries::Other),
            transfer: ColorTransfer::n(coded.transfer).unwrap_or(ColorTransfer::Other),
            matrix: ColorMatrix::n(coded.matrix).unwrap_or(ColorMatrix::Other),
        }
    }

    /// Take the coded value for every specified field, and the default for
    /// unspecified ones.
    pub fn merge(default: &ColorAspects, coded: &ColorAspects) -> Self {
        Self {
            range: if coded.range == ColorRange::Unspecified {
                default.range
            } else {
                coded.range
            },
            primaries: if coded.primaries == ColorPrimaries::Unspecified {
                default.primaries
            } else {
                coded.primaries
            },
            transfer: if coded.transfer == ColorTransfer::Unspecified {
                default.transfer
            } else {
                coded.transfer
            },
            matrix: if coded.matrix == ColorMatrix::Unspecified {
                default.matrix
            } else {
                coded.matrix
            },
        }
    }
}

/// Decoding capabilities advertised by the device for one codec. Profile
/// and level values are the device's control menu indices.
#[derive(Clone, Debug, Default)]
pub struct SupportedCapabilities {
    pub profiles: Vec<u32>,
    pub levels: Vec<u32>,
    pub max_resolution: Option<Resolution>,
}

fn profile_control(codec: VideoCodec) -> u32 {
    match codec {
        VideoCodec::H264 => bindings::V4L2_CID_MPEG_VIDEO_H264_PROFILE,
        VideoCodec::HEVC => bindings::V4L2_CID_MPEG_VIDEO_HEVC_PROFILE,
        VideoCodec::VP8 => bindings::V4L2_CID_MPEG_VIDEO_VP8_PROFILE,
        VideoCodec::VP9 => bindings::V4L2_CID_MPEG_VIDEO_VP9_PROFILE,
    }
}

fn level_control(codec: VideoCodec) -> Option<u32> {
    match codec {
        VideoCodec::H264 => Some(bindings::V4L2_CID_MPEG_VIDEO_H264_LEVEL),
        VideoCodec::HEVC => Some(bindings::V4L2_CID_MPEG_VIDEO_HEVC_LEVEL),
        // VP8 has no level control.
        VideoCodec::VP8 => None,
        VideoCodec::VP9 => Some(bindings::V4L2_CID_MPEG_VIDEO_VP9_LEVEL),
    }
}

fn query_menu_indices(device: &VideoDevice, ctrl: u32) -> Vec<u32> {
    let Some(ctrl_id) = CtrlId::new(ctrl) else {
        return Vec::new();
    };
    let query_ctrl: bindings::v4l2_queryctrl =
        match ioctl::queryctrl(device.device().as_ref(), ctrl_id, QueryCtrlFlags::empty()) {
            Ok(query_ctrl) => query_ctrl,
            Err(_) => return Vec::new(),
        };

    let mut indices = Vec::new();
    for index in (query_ctrl.minimum as u32)..=(query_ctrl.maximum as u32) {
        let menu: Result<bindings::v4l2_querymenu, _> =
            ioctl::querymenu(device.device().as_ref(), query_ctrl.id, index);
        if let Ok(menu) = menu {
            indices.push(menu.index);
        }
    }
    indices
}

/// Probe the decoder device for `codec`. `None` when no device handles the
/// codec at all.
pub fn query_capabilities(codec: VideoCodec) -> Option<SupportedCapabilities> {
    let device = VideoDevice::open_for_codec(codec).ok()?;

    let profiles = query_menu_indices(&device, profile_control(codec));
    let levels = level_control(codec)
        .map(|ctrl| query_menu_indices(&device, ctrl))
        .unwrap_or_default();

    let pixel_format = codec_to_pixel_format(codec);
    let max_resolution = ioctl::enum_frame_sizes(device.device().as_ref(), 0, pixel_format)
        .ok()
        .and_then(|sizes: bindings::v4l2_frmsizeenum| match sizes.size() {
            Some(ioctl::FrmSizeTypes::StepWise(stepwise)) => {
                Some(Resolution::new(stepwise.max_width, stepwise.max_height))
            }
            Some(ioctl::FrmSizeTypes::Discrete(discrete)) => {
                Some(Resolution::new(discrete.width, discrete.height))
            }
            None => None,
        });

    Some(SupportedCapabilities {
        profiles,
        levels,
        max_resolution,
    })
}

// Default profile menu indices advertised when the device query is
// unsupported.
const DEFAULT_H264_PROFILES: [u32; 4] = [0, 1, 2, 4]; // baseline, constrained baseline, main, high
const DEFAULT_VP8_PROFILES: [u32; 1] = [0];
const DEFAULT_VP9_PROFILES: [u32; 1] = [0];
const DEFAULT_HEVC_PROFILES: [u32; 1] = [0]; // main

fn default_profiles(codec: VideoCodec) -> Vec<u32> {
    match codec {
        VideoCodec::H264 => DEFAULT_H264_PROFILES.to_vec(),
        VideoCodec::VP8 => DEFAULT_VP8_PROFILES.to_vec(),
        VideoCodec::VP9 => DEFAULT_VP9_PROFILES.to_vec(),
        VideoCodec::HEVC => DEFAULT_HEVC_PROFILES.to_vec(),
    }
}

fn default_levels(codec: VideoCodec) -> Vec<u32> {
    match codec {
        // 1 through 5.2.
        VideoCodec::H264 => (0..=16).collect(),
        VideoCodec::VP8 => Vec::new(),
        // 1 through 5.
        VideoCodec::VP9 => (0..=8).collect(),
        // Main 1 through main 6.2.
        VideoCodec::HEVC => (0..=12).collect(),
    }
}

/// The default resolution limit when the device capability is unknown.
const DEFAULT_MAX_RESOLUTION: Resolution = Resolution {
    width: 4096,
    height: 4096,
};

/// The number of frames the client must keep in flight on top of the codec
/// pipeline before stalling, tied to the input slot count.
const PIPELINE_DELAY: u32 = 3;

/// Codec2-style parameter/capability object for one decode component.
#[derive(Debug)]
pub struct DecodeInterface {
    name: String,
    codec: VideoCodec,
    secure: bool,
    profiles: Vec<u32>,
    levels: Vec<u32>,
    max_resolution: Resolution,
    picture_size: Resolution,
    output_block_pool_id: u64,
    default_color_aspects: ColorAspects,
    coded_color_aspects: ColorAspects,
}

impl DecodeInterface {
    /// Build the interface for a component `name`, probing the device for
    /// its capabilities. A missing device leaves the codec defaults.
    pub fn new(name: &str, codec: VideoCodec) -> Self {
        let caps = query_capabilities(codec).unwrap_or_default();

        let mut profiles = caps.profiles;
        if profiles.is_empty() {
            log::warn!("no supported profiles advertised for {codec}, using defaults");
            profiles = default_profiles(codec);
        }
        let mut levels = caps.levels;
        if levels.is_empty() && !matches!(codec, VideoCodec::VP8) {
            log::warn!("no supported levels advertised for {codec}, using defaults");
            levels = default_levels(codec);
        }
        let max_resolution = caps.max_resolution.unwrap_or(DEFAULT_MAX_RESOLUTION);

        Self {
            name: name.to_owned(),
            codec,
            secure: name.contains(".secure"),
            profiles,
            levels,
            max_resolution,
            picture_size: Resolution::new(
                std::cmp::min(320, max_resolution.width),
                std::cmp::min(240, max_resolution.height),
            ),
            output_block_pool_id: 0,
            // The coded range defaults to limited until a VUI says
            // otherwise.
            default_color_aspects: ColorAspects::default(),
            coded_color_aspects: ColorAspects {
                range: ColorRange::Limited,
                ..ColorAspects::default()
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn video_codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn supported_profiles(&self) -> &[u32] {
        &self.profiles
    }

    pub fn supported_levels(&self) -> &[u32] {
        &self.levels
    }

    pub fn max_resolution(&self) -> Resolution {
        self.max_resolution
    }

    pub fn picture_size(&self) -> Resolution {
        self.picture_size
    }

    /// Picture dimensions are stepped by 16 within the device limits.
    pub fn set_picture_size(&mut self, size: Resolution) -> Result<(), String> {
        let valid = |value: u32, max: u32| value >= 16 && value <= max && value % 16 == 0;
        if !valid(size.width, self.max_resolution.width)
            || !valid(size.height, self.max_resolution.height)
        {
            return Err(format!(
                "picture size {size} out of range (max {}, step 16)",
                self.max_resolution
            ));
        }
        self.picture_size = size;
        Ok(())
    }

    /// The input buffer size negotiated with the kernel, derived from the
    /// configured picture area.
    pub fn input_buffer_size(&self) -> usize {
        calculate_input_buffer_size(self.picture_size.area())
    }

    pub fn input_media_type(&self) -> &'static str {
        match self.codec {
            VideoCodec::H264 => "video/avc",
            VideoCodec::HEVC => "video/hevc",
            VideoCodec::VP8 => "video/x-vnd.on2.vp8",
            VideoCodec::VP9 => "video/x-vnd.on2.vp9",
        }
    }

    pub fn output_media_type(&self) -> &'static str {
        "video/raw"
    }

    /// How many decoded frames the client should expect to remain inside the
    /// decoder before output starts flowing.
    pub fn output_delay(&self) -> u32 {
        match self.codec {
            // An H.264/HEVC decoder might need this many additional input
            // frames queued before the associated decoded buffers come out,
            // due to frame reordering.
            VideoCodec::H264 => 16,
            VideoCodec::HEVC => 16,
            // Frames held as references while decoding; see RFC 6386
            // section 3.
            VideoCodec::VP8 => 3,
            // https://www.webmproject.org/vp9/levels/
            VideoCodec::VP9 => 8,
        }
    }

    pub fn pipeline_delay(&self) -> u32 {
        PIPELINE_DELAY
    }

    /// The minimum number of output buffers that keeps every stage of the
    /// pipeline supplied: client output slots (output delay + smoothness
    /// factor), the compositor (rendering depth), and the decoder itself.
    pub fn min_num_output_buffers(&self) -> usize {
        const SMOOTHNESS_FACTOR: usize = 4;
        const RENDERING_DEPTH: usize = 3;
        const EXTRA_NUM_OUTPUT_BUFFERS_FOR_DECODER: usize = 2;

        self.output_delay() as usize
            + SMOOTHNESS_FACTOR
            + RENDERING_DEPTH
            + EXTRA_NUM_OUTPUT_BUFFERS_FOR_DECODER
    }

    pub fn output_block_pool_id(&self) -> u64 {
        self.output_block_pool_id
    }

    pub fn set_output_block_pool_id(&mut self, id: u64) {
        self.output_block_pool_id = id;
    }

    pub fn default_color_aspects(&self) -> ColorAspects {
        self.default_color_aspects
    }

    pub fn set_default_color_aspects(&mut self, aspects: ColorAspects) {
        self.default_color_aspects = aspects;
    }

    pub fn coded_color_aspects(&self) -> ColorAspects {
        self.coded_color_aspects
    }

    /// Record color aspects extracted from the stream's SPS.
    pub fn set_coded_color_aspects(&mut self, coded: codec::ColorAspects) {
        self.coded_color_aspects = ColorAspects::from_coded(coded);
    }

    /// The color aspects reported outward: coded values where the stream
    /// specified them, defaults elsewhere.
    pub fn merged_color_aspects(&self) -> ColorAspects {
        ColorAspects::merge(&self.default_color_aspects, &self.coded_color_aspects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_buffer_sizing_by_area() {
        let small = Resolution::new(1280, 720);
        let fhd = Resolution::new(1920, 1088);
        let uhd = Resolution::new(3840, 2160);
        assert_eq!(
            calculate_input_buffer_size(small.area()),
            INPUT_BUFFER_SIZE_FOR_1080P
        );
        assert_eq!(
            calculate_input_buffer_size(fhd.area()),
            INPUT_BUFFER_SIZE_FOR_1080P
        );
        assert_eq!(
            calculate_input_buffer_size(uhd.area()),
            INPUT_BUFFER_SIZE_FOR_4K
        );
    }

    #[test]
    fn output_delay_by_codec() {
        assert_eq!(DecodeInterface::new("c2.v4l2.avc.decoder", VideoCodec::H264).output_delay(), 16);
        assert_eq!(DecodeInterface::new("c2.v4l2.hevc.decoder", VideoCodec::HEVC).output_delay(), 16);
        assert_eq!(DecodeInterface::new("c2.v4l2.vp8.decoder", VideoCodec::VP8).output_delay(), 3);
        assert_eq!(DecodeInterface::new("c2.v4l2.vp9.decoder", VideoCodec::VP9).output_delay(), 8);
    }

    #[test]
    fn secure_suffix_detection() {
        assert!(!DecodeInterface::new("c2.v4l2.avc.decoder", VideoCodec::H264).is_secure());
        assert!(DecodeInterface::new("c2.v4l2.avc.decoder.secure", VideoCodec::H264).is_secure());
    }

    #[test]
    fn profile_defaults_when_query_unsupported() {
        // Without a decoder device the codec defaults apply.
        let intf = DecodeInterface::new("c2.v4l2.avc.decoder", VideoCodec::H264);
        assert!(!intf.supported_profiles().is_empty());
        assert!(!intf.supported_levels().is_empty());
        assert!(intf.max_resolution().width >= 16);

        let vp8 = DecodeInterface::new("c2.v4l2.vp8.decoder", VideoCodec::VP8);
        if query_capabilities(VideoCodec::VP8).is_none() {
            assert_eq!(vp8.supported_profiles(), &[0]);
        } else {
            assert!(!vp8.supported_profiles().is_empty());
        }
    }

    #[test]
    fn picture_size_is_stepped_by_16() {
        let mut intf = DecodeInterface::new("c2.v4l2.avc.decoder", VideoCodec::H264);
        assert!(intf.set_picture_size(Resolution::new(1920, 1088)).is_ok());
        assert_eq!(intf.picture_size(), Resolution::new(1920, 1088));
        assert!(intf.set_picture_size(Resolution::new(1921, 1088)).is_err());
        assert!(intf.set_picture_size(Resolution::new(8, 16)).is_err());
        assert!(intf
            .set_picture_size(Resolution::new(1 << 20, 16))
            .is_err());
    }

    #[test]
    fn merged_color_aspects_substitute_unspecified_fields() {
        let mut intf = DecodeInterface::new("c2.v4l2.hevc.decoder", VideoCodec::HEVC);
        intf.set_default_color_aspects(ColorAspects {
            range: ColorRange::Limited,
            primaries: ColorPrimaries::Bt709,
            transfer: ColorTransfer::Bt709,
            matrix: ColorMatrix::Bt709,
        });

        // Nothing coded yet except the limited-range default: the tuning
        // values win for the other fields.
        let merged = intf.merged_color_aspects();
        assert_eq!(merged.primaries, ColorPrimaries::Bt709);
        assert_eq!(merged.range, ColorRange::Limited);

        // A full VUI overrides every field.
        intf.set_coded_color_aspects(codec::ColorAspects {
            primaries: 9,
            transfer: 16,
            matrix: 9,
            full_range: true,
        });
        let merged = intf.merged_color_aspects();
        assert_eq!(merged.range, ColorRange::Full);
        assert_eq!(merged.primaries, ColorPrimaries::Bt2020);
        assert_eq!(merged.transfer, ColorTransfer::Smpte2084);
        assert_eq!(merged.matrix, ColorMatrix::Bt2020Ncl);
    }

    #[test]
    fn unknown_vui_indices_map_to_other() {
        let coded = codec::ColorAspects {
            primaries: 100,
            transfer: 3,
            matrix: 200,
            full_range: false,
        };
        let aspects = ColorAspects::from_coded(coded);
        assert_eq!(aspects.primaries, ColorPrimaries::Other);
        assert_eq!(aspects.transfer, ColorTransfer::Other);
        assert_eq!(aspects.matrix, ColorMatrix::Other);
        assert_eq!(aspects.range, ColorRange::Limited);
    }
}
