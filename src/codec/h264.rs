// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::nalu_reader::NaluReader;
use crate::codec::ColorAspects;
use crate::codec::ParseError;
use crate::codec::ParseResult;

/// Profiles for which the SPS carries chroma/bit-depth information ahead of
/// the frame geometry.
const HIGH_PROFILE_IDS: [u32; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

const MAX_PIC_ORDER_CNT_CYCLE: u32 = 255;

// A scaling list is delta-coded; walking it means reading deltas until one
// zeroes the next scale.
fn skip_scaling_list(br: &mut NaluReader, size: usize) -> ParseResult<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;

    for _ in 0..size {
        if next_scale != 0 {
            let delta_scale = br.read_se()?;
            next_scale = (last_scale + delta_scale + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }

    Ok(())
}

/// Extract the color aspects from an H.264 SPS NAL unit (start code
/// excluded, one-byte NAL header included). Returns `None` when the SPS does
/// not carry a VUI color description.
pub fn parse_color_aspects(nalu: &[u8]) -> ParseResult<Option<ColorAspects>> {
    if nalu.len() <= 1 {
        return Err(ParseError::InsufficientData);
    }
    // There is no way to jump to the VUI; the whole SPS up to it must be
    // walked.
    let mut br = NaluReader::new(&nalu[1..]);

    let profile_idc: u32 = br.read_bits(8)?;
    br.skip_bits(8)?; // constraint_set flags + reserved_zero_2bits
    br.skip_bits(8)?; // level_idc
    br.read_ue()?; // seq_parameter_set_id

    if HIGH_PROFILE_IDS.contains(&profile_idc) {
        let chroma_format_idc = br.read_ue()?;
        if chroma_format_idc == 3 {
            br.skip_bits(1)?; // separate_colour_plane_flag
        }
        br.read_ue()?; // bit_depth_luma_minus8
        br.read_ue()?; // bit_depth_chroma_minus8
        br.skip_bits(1)?; // qpprime_y_zero_transform_bypass_flag
        if br.read_bit()? {
            // seq_scaling_matrix_present_flag
            let num_lists = if chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..num_lists {
                if br.read_bit()? {
                    // seq_scaling_list_present_flag[i]
                    skip_scaling_list(&mut br, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    br.read_ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = br.read_ue()?;
    if pic_order_cnt_type == 0 {
        br.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        br.skip_bits(1)?; // delta_pic_order_always_zero_flag
        br.read_se()?; // offset_for_non_ref_pic
        br.read_se()?; // offset_for_top_to_bottom_field
        let num_ref_frames_in_pic_order_cnt_cycle = br.read_ue_max(MAX_PIC_ORDER_CNT_CYCLE)?;
        for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
            br.read_se()?; // offset_for_ref_frame
        }
    }
    br.read_ue()?; // max_num_ref_frames
    br.skip_bits(1)?; // gaps_in_frame_num_value_allowed_flag
    br.read_ue()?; // pic_width_in_mbs_minus1
    br.read_ue()?; // pic_height_in_map_units_minus1
    if !br.read_bit()? {
        // frame_mbs_only_flag
        br.skip_bits(1)?; // mb_adaptive_frame_field_flag
    }
    br.skip_bits(1)?; // direct_8x8_inference_flag
    if br.read_bit()? {
        // frame_cropping_flag
        br.read_ue()?; // frame_crop_left_offset
        br.read_ue()?; // frame_crop_right_offset
        br.read_ue()?; // frame_crop_top_offset
        br.read_ue()?; // frame_crop_bottom_offset
    }

    if !br.read_bit()? {
        // vui_parameters_present_flag
        return Ok(None);
    }

    if br.read_bit()? {
        // aspect_ratio_info_present_flag
        let aspect_ratio_idc: u32 = br.read_bits(8)?;
        if aspect_ratio_idc == 255 {
            br.skip_bits(32)?; // sar_width + sar_height
        }
    }
    if br.read_bit()? {
        // overscan_info_present_flag
        br.skip_bits(1)?; // overscan_appropriate_flag
    }
    if !br.read_bit()? {
        // video_signal_type_present_flag
        return Ok(None);
    }
    br.skip_bits(3)?; // video_format
    let full_range = br.read_bit()?; // video_full_range_flag
    if !br.read_bit()? {
        // colour_description_present_flag
        return Ok(None);
    }

    Ok(Some(ColorAspects {
        primaries: br.read_bits(8)?,
        transfer: br.read_bits(8)?,
        matrix: br.read_bits(8)?,
        full_range,
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::nalu::NaluWalker;

    /// Builds a baseline 16x16 SPS bit by bit, with a VUI that carries only
    /// the video signal type.
    pub(crate) fn build_sps_with_vui(
        primaries: u8,
        transfer: u8,
        matrix: u8,
        full_range: bool,
    ) -> Vec<u8> {
        let mut bits = String::new();
        bits.push_str(&format!("{:08b}", 66u8)); // profile_idc
        bits.push_str("00000000"); // constraint flags + reserved
        bits.push_str(&format!("{:08b}", 30u8)); // level_idc
        bits.push('1'); // seq_parameter_set_id = ue(0)
        bits.push('1'); // log2_max_frame_num_minus4 = ue(0)
        bits.push('1'); // pic_order_cnt_type = ue(0)
        bits.push('1'); // log2_max_pic_order_cnt_lsb_minus4 = ue(0)
        bits.push('1'); // max_num_ref_frames = ue(0)
        bits.push('0'); // gaps_in_frame_num_value_allowed_flag
        bits.push('1'); // pic_width_in_mbs_minus1 = ue(0)
        bits.push('1'); // pic_height_in_map_units_minus1 = ue(0)
        bits.push('1'); // frame_mbs_only_flag
        bits.push('0'); // direct_8x8_inference_flag
        bits.push('0'); // frame_cropping_flag
        bits.push('1'); // vui_parameters_present_flag
        bits.push('0'); // aspect_ratio_info_present_flag
        bits.push('0'); // overscan_info_present_flag
        bits.push('1'); // video_signal_type_present_flag
        bits.push_str("101"); // video_format = unspecified
        bits.push(if full_range { '1' } else { '0' });
        bits.push('1'); // colour_description_present_flag
        bits.push_str(&format!("{:08b}", primaries));
        bits.push_str(&format!("{:08b}", transfer));
        bits.push_str(&format!("{:08b}", matrix));

        let mut nalu = vec![0x67];
        let mut byte = 0u8;
        let mut count = 0;
        for bit in bits.chars() {
            byte = (byte << 1) | (bit == '1') as u8;
            count += 1;
            if count == 8 {
                nalu.push(byte);
                byte = 0;
                count = 0;
            }
        }
        if count > 0 {
            nalu.push(byte << (8 - count));
        }
        nalu
    }

    #[test]
    fn extracts_vui_color_description() {
        let nalu = build_sps_with_vui(9, 16, 9, true);
        let aspects = parse_color_aspects(&nalu).unwrap().unwrap();
        assert_eq!(aspects.primaries, 9);
        assert_eq!(aspects.transfer, 16);
        assert_eq!(aspects.matrix, 9);
        assert!(aspects.full_range);

        let nalu = build_sps_with_vui(1, 1, 1, false);
        let aspects = parse_color_aspects(&nalu).unwrap().unwrap();
        assert_eq!(aspects.primaries, 1);
        assert!(!aspects.full_range);
    }

    #[test]
    fn truncated_sps_is_insufficient_data() {
        let nalu = build_sps_with_vui(1, 1, 1, false);
        assert_eq!(
            parse_color_aspects(&nalu[..nalu.len() - 2]),
            Err(ParseError::InsufficientData)
        );
        assert_eq!(
            parse_color_aspects(&[0x67]),
            Err(ParseError::InsufficientData)
        );
    }

    #[test]
    fn locates_sps_in_stream() {
        let mut stream = vec![0x00, 0x00, 0x00, 0x01];
        stream.extend_from_slice(&build_sps_with_vui(9, 9, 9, false));
        stream.extend_from_slice(&[0x00, 0x00, 0x01, 0x68, 0xce, 0x38, 0x80]);

        let mut walker = NaluWalker::h264(&stream);
        assert!(walker.locate_sps());
        let aspects = parse_color_aspects(walker.nalu()).unwrap().unwrap();
        assert_eq!(aspects.matrix, 9);
        assert!(!walker.locate_sps());
    }
}
