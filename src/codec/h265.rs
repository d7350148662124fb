// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::nalu_reader::NaluReader;
use crate::codec::ColorAspects;
use crate::codec::ParseError;
use crate::codec::ParseResult;

const MAX_SHORT_TERM_REF_PIC_SETS: usize = 64;

#[derive(Copy, Clone)]
struct StRefPicSet {
    // Syntax elements.
    num_negative_pics: usize,
    num_positive_pics: usize,
    delta_poc_s0: [i32; MAX_SHORT_TERM_REF_PIC_SETS + 1],
    delta_poc_s1: [i32; MAX_SHORT_TERM_REF_PIC_SETS + 1],

    // Calculated field.
    num_delta_pocs: usize,
}

impl Default for StRefPicSet {
    fn default() -> Self {
        Self {
            num_negative_pics: 0,
            num_positive_pics: 0,
            delta_poc_s0: [0; MAX_SHORT_TERM_REF_PIC_SETS + 1],
            delta_poc_s1: [0; MAX_SHORT_TERM_REF_PIC_SETS + 1],
            num_delta_pocs: 0,
        }
    }
}

// Skip an HEVC ProfileTierLevel in the specified bitstream.
fn skip_profile_tier_level(br: &mut NaluReader, sps_max_sublayers_minus1: u32) -> ParseResult<()> {
    // general_profile_space(2), general_tier_flag(1), general_profile_idc(5),
    // general_profile_compatibility_flag(32), general_progressive_source_flag(1),
    // general_interlaced_source_flag(1), general_non_packed_constraint_flag(1),
    // general_frame_only_constraint_flag(1), compatibility_flags(43),
    // general_inbld_flag(1), general_level_idc(8)
    br.skip_bits(96)?;
    if sps_max_sublayers_minus1 > 6 {
        return Err(ParseError::MalformedStream(
            "sps_max_sub_layers_minus1 out of range",
        ));
    }
    let mut sub_layer_profile_present = [false; 6];
    let mut sub_layer_level_present = [false; 6];
    for i in 0..sps_max_sublayers_minus1 as usize {
        sub_layer_profile_present[i] = br.read_bit()?;
        sub_layer_level_present[i] = br.read_bit()?;
    }
    if sps_max_sublayers_minus1 > 0 {
        br.skip_bits(2 * (8 - sps_max_sublayers_minus1) as usize)?;
    }
    for i in 0..sps_max_sublayers_minus1 as usize {
        if sub_layer_profile_present[i] {
            // sub_layer_profile_space(2), sub_layer_tier_flag(1),
            // sub_layer_profile_idc(5), sub_layer_profile_compatibility_flag(32),
            // sub_layer_progressive_source_flag(1),
            // sub_layer_interlaced_source_flag(1),
            // sub_layer_non_packed_constraint_flag(1),
            // sub_layer_frame_only_constraint_flag(1), compatibility_flags(43),
            // sub_layer_inbld_flag(1)
            br.skip_bits(88)?;
        }
        if sub_layer_level_present[i] {
            br.skip_bits(8)?; // sub_layer_level_idc
        }
    }
    Ok(())
}

// Skip an HEVC ScalingListData in the specified bitstream.
fn skip_scaling_list_data(br: &mut NaluReader) -> ParseResult<()> {
    for size_id in 0..4 {
        let mut matrix_id = 0;
        while matrix_id < 6 {
            if !br.read_bit()? {
                // scaling_list_pred_mode_flag
                br.read_ue()?; // scaling_list_pred_matrix_id_delta
            } else {
                if size_id > 1 {
                    br.read_se()?; // scaling_list_dc_coef_16x16 or 32x32
                }
                let coef_num = std::cmp::min(64, 1 << (4 + (size_id << 1)));
                for _ in 0..coef_num {
                    br.read_se()?; // scaling_list_delta_coef
                }
            }
            matrix_id += if size_id == 3 { 3 } else { 1 };
        }
    }
    Ok(())
}

// Skip an HEVC StRefPicSet in the specified bitstream, keeping the delta POC
// bookkeeping needed by the sets that predict from it.
fn skip_st_ref_pic_set(
    br: &mut NaluReader,
    st_rps_idx: u32,
    num_short_term_ref_pic_sets: u32,
    all_ref_pic_sets: &mut [StRefPicSet],
) -> ParseResult<()> {
    let mut curr = StRefPicSet::default();
    let inter_ref_pic_set_prediction = if st_rps_idx != 0 { br.read_bit()? } else { false };

    if inter_ref_pic_set_prediction {
        let mut delta_idx_minus1 = 0u32;
        if st_rps_idx == num_short_term_ref_pic_sets {
            delta_idx_minus1 = br.read_ue()?;
            if delta_idx_minus1 + 1 > st_rps_idx {
                return Err(ParseError::MalformedStream("delta_idx_minus1 out of range"));
            }
        }
        let ref_rps_idx = (st_rps_idx - (delta_idx_minus1 + 1)) as usize;
        let delta_rps_sign = br.read_bit()?;
        let abs_delta_rps_minus1 = br.read_ue()?;
        let delta_rps =
            (if delta_rps_sign { -1 } else { 1 }) * (abs_delta_rps_minus1 as i32 + 1);
        let ref_set = all_ref_pic_sets[ref_rps_idx];

        // use_delta_flag defaults to 1 if not present.
        let mut use_delta = [true; MAX_SHORT_TERM_REF_PIC_SETS + 1];
        for flag in use_delta.iter_mut().take(ref_set.num_delta_pocs + 1) {
            let used_by_curr_pic = br.read_bit()?;
            if !used_by_curr_pic {
                *flag = br.read_bit()?;
            }
        }

        let mut i = 0;
        for j in (0..ref_set.num_positive_pics).rev() {
            let d_poc = ref_set.delta_poc_s1[j] + delta_rps;
            if d_poc < 0 && use_delta[ref_set.num_negative_pics + j] {
                curr.delta_poc_s0[i] = d_poc;
                i += 1;
            }
        }
        if delta_rps < 0 && use_delta[ref_set.num_delta_pocs] {
            curr.delta_poc_s0[i] = delta_rps;
            i += 1;
        }
        for j in 0..ref_set.num_negative_pics {
            let d_poc = ref_set.delta_poc_s0[j] + delta_rps;
            if d_poc < 0 && use_delta[j] {
                curr.delta_poc_s0[i] = d_poc;
                i += 1;
            }
        }
        curr.num_negative_pics = i;

        let mut i = 0;
        for j in (0..ref_set.num_negative_pics).rev() {
            let d_poc = ref_set.delta_poc_s0[j] + delta_rps;
            if d_poc > 0 && use_delta[j] {
                curr.delta_poc_s1[i] = d_poc;
                i += 1;
            }
        }
        if delta_rps > 0 && use_delta[ref_set.num_delta_pocs] {
            curr.delta_poc_s1[i] = delta_rps;
            i += 1;
        }
        for j in 0..ref_set.num_positive_pics {
            let d_poc = ref_set.delta_poc_s1[j] + delta_rps;
            if d_poc > 0 && use_delta[ref_set.num_negative_pics + j] {
                curr.delta_poc_s1[i] = d_poc;
                i += 1;
            }
        }
        curr.num_positive_pics = i;
    } else {
        curr.num_negative_pics = br.read_ue_max(MAX_SHORT_TERM_REF_PIC_SETS as u32)? as usize;
        curr.num_positive_pics = br.read_ue_max(MAX_SHORT_TERM_REF_PIC_SETS as u32)? as usize;
        for i in 0..curr.num_negative_pics {
            let delta_poc_s0_minus1 = br.read_ue()?;
            curr.delta_poc_s0[i] = if i == 0 {
                -(delta_poc_s0_minus1 as i32 + 1)
            } else {
                curr.delta_poc_s0[i - 1] - (delta_poc_s0_minus1 as i32 + 1)
            };
            br.skip_bits(1)?; // used_by_curr_pic_s0
        }
        for i in 0..curr.num_positive_pics {
            let delta_poc_s1_minus1 = br.read_ue()?;
            curr.delta_poc_s1[i] = if i == 0 {
                delta_poc_s1_minus1 as i32 + 1
            } else {
                curr.delta_poc_s1[i - 1] + delta_poc_s1_minus1 as i32 + 1
            };
            br.skip_bits(1)?; // used_by_curr_pic_s1
        }
    }

    curr.num_delta_pocs = curr.num_negative_pics + curr.num_positive_pics;
    if curr.num_delta_pocs > MAX_SHORT_TERM_REF_PIC_SETS {
        return Err(ParseError::MalformedStream("num_delta_pocs out of range"));
    }
    all_ref_pic_sets[st_rps_idx as usize] = curr;
    Ok(())
}

/// Extract the color aspects from an HEVC SPS NAL unit (start code excluded,
/// two-byte NAL header included). Returns `None` when the SPS does not carry
/// a VUI color description.
pub fn parse_color_aspects(nalu: &[u8]) -> ParseResult<Option<ColorAspects>> {
    if nalu.len() <= 2 {
        return Err(ParseError::InsufficientData);
    }
    // The VUI parameters live at the very end of the SPS; everything before
    // them must be walked.
    let mut br = NaluReader::new(&nalu[2..]);

    br.skip_bits(4)?; // sps_video_parameter_set_id
    let sps_max_sublayers_minus1: u32 = br.read_bits(3)?;
    br.skip_bits(1)?; // sps_temporal_id_nesting_flag

    skip_profile_tier_level(&mut br, sps_max_sublayers_minus1)?;

    br.read_ue()?; // sps_seq_parameter_set_id
    let chroma_format_idc = br.read_ue()?;
    if chroma_format_idc == 3 {
        br.skip_bits(1)?; // separate_colour_plane_flag
    }
    br.read_ue()?; // pic_width_in_luma_samples
    br.read_ue()?; // pic_height_in_luma_samples

    if br.read_bit()? {
        // conformance_window_flag
        br.read_ue()?; // conf_win_left_offset
        br.read_ue()?; // conf_win_right_offset
        br.read_ue()?; // conf_win_top_offset
        br.read_ue()?; // conf_win_bottom_offset
    }
    br.read_ue()?; // bit_depth_luma_minus8
    br.read_ue()?; // bit_depth_chroma_minus8
    let log2_max_pic_order_cnt_lsb_minus4 = br.read_ue()?;

    let sps_sub_layer_ordering_info_present = br.read_bit()?;
    let first_sublayer = if sps_sub_layer_ordering_info_present {
        0
    } else {
        sps_max_sublayers_minus1
    };
    for _ in first_sublayer..=sps_max_sublayers_minus1 {
        br.read_ue()?; // sps_max_dec_pic_buffering_minus1
        br.read_ue()?; // sps_max_num_reorder_pics
        br.read_ue()?; // sps_max_latency_increase_plus1
    }
    br.read_ue()?; // log2_min_luma_coding_block_size_minus3
    br.read_ue()?; // log2_diff_max_min_luma_coding_block_size
    br.read_ue()?; // log2_min_luma_transform_block_size_minus2
    br.read_ue()?; // log2_diff_max_min_luma_transform_block_size
    br.read_ue()?; // max_transform_hierarchy_depth_inter
    br.read_ue()?; // max_transform_hierarchy_depth_intra
    if br.read_bit()? {
        // scaling_list_enabled_flag
        if br.read_bit()? {
            // sps_scaling_list_data_present_flag
            skip_scaling_list_data(&mut br)?;
        }
    }

    br.skip_bits(2)?; // amp_enabled_flag(1), sample_adaptive_offset_enabled_flag(1)
    if br.read_bit()? {
        // pcm_enabled_flag
        // pcm_sample_bit_depth_luma_minus1(4), pcm_sample_bit_depth_chroma_minus1(4)
        br.skip_bits(8)?;
        br.read_ue()?; // log2_min_pcm_luma_coding_block_size_minus3
        br.read_ue()?; // log2_diff_max_min_pcm_luma_coding_block_size
        br.skip_bits(1)?; // pcm_loop_filter_disabled_flag
    }

    let num_short_term_ref_pic_sets = br.read_ue()?;
    if num_short_term_ref_pic_sets > MAX_SHORT_TERM_REF_PIC_SETS as u32 {
        return Err(ParseError::MalformedStream(
            "num_short_term_ref_pic_sets out of range",
        ));
    }
    let mut all_ref_pic_sets = [StRefPicSet::default(); MAX_SHORT_TERM_REF_PIC_SETS];
    for i in 0..num_short_term_ref_pic_sets {
        skip_st_ref_pic_set(&mut br, i, num_short_term_ref_pic_sets, &mut all_ref_pic_sets)?;
    }

    if br.read_bit()? {
        // long_term_ref_pics_present_flag
        let num_long_term_ref_pics_sps = br.read_ue()?;
        for _ in 0..num_long_term_ref_pics_sps {
            // lt_ref_pic_poc_lsb_sps
            br.read_bits::<u32>(log2_max_pic_order_cnt_lsb_minus4 as usize + 4)?;
            br.skip_bits(1)?; // used_by_curr_pic_lt_sps_flag
        }
    }
    // sps_temporal_mvp_enabled_flag(1), strong_intra_smoothing_enabled_flag(1)
    br.skip_bits(2)?;

    if !br.read_bit()? {
        // vui_parameters_present_flag
        return Ok(None);
    }

    if br.read_bit()? {
        // aspect_ratio_info_present_flag
        let aspect_ratio_idc: u32 = br.read_bits(8)?;
        if aspect_ratio_idc == 255 {
            // extended sample aspect ratio
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

    #[derive(Default)]
    pub(crate) struct SpsBits {
        bits: String,
    }

    impl SpsBits {
        fn u(&mut self, value: u32, num_bits: usize) -> &mut Self {
            for i in (0..num_bits).rev() {
                self.bits.push(if value & (1 << i) != 0 { '1' } else { '0' });
            }
            self
        }

        fn ue(&mut self, value: u32) -> &mut Self {
            let code = value as u64 + 1;
            let num_bits = 64 - code.leading_zeros() as usize;
            for _ in 1..num_bits {
                self.bits.push('0');
            }
            for i in (0..num_bits).rev() {
                self.bits.push(if code & (1 << i) != 0 { '1' } else { '0' });
            }
            self
        }

        fn into_nalu(self) -> Vec<u8> {
            // Two-byte HEVC NAL unit header for an SPS (type 33).
            let mut nalu = vec![0x42, 0x01];
            let mut byte = 0u8;
            let mut count = 0;
            for bit in self.bits.chars() {
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
    }

    /// A minimal main-profile SPS whose VUI carries only the video signal
    /// type.
    pub(crate) fn build_sps(
        primaries: u8,
        transfer: u8,
        matrix: u8,
        full_range: bool,
    ) -> Vec<u8> {
        let mut sps = SpsBits::default();
        sps.u(0, 4) // sps_video_parameter_set_id
            .u(0, 3) // sps_max_sub_layers_minus1
            .u(1, 1) // sps_temporal_id_nesting_flag
            .u(0, 31) // profile_tier_level, 96 fixed bits
            .u(0, 31)
            .u(0, 31)
            .u(0, 3)
            .ue(0) // sps_seq_parameter_set_id
            .ue(1) // chroma_format_idc
            .ue(320) // pic_width_in_luma_samples
            .ue(240) // pic_height_in_luma_samples
            .u(0, 1) // conformance_window_flag
            .ue(0) // bit_depth_luma_minus8
            .ue(0) // bit_depth_chroma_minus8
            .ue(0) // log2_max_pic_order_cnt_lsb_minus4
            .u(0, 1) // sps_sub_layer_ordering_info_present_flag
            .ue(4) // sps_max_dec_pic_buffering_minus1
            .ue(0) // sps_max_num_reorder_pics
            .ue(0) // sps_max_latency_increase_plus1
            .ue(0) // log2_min_luma_coding_block_size_minus3
            .ue(3) // log2_diff_max_min_luma_coding_block_size
            .ue(0) // log2_min_luma_transform_block_size_minus2
            .ue(3) // log2_diff_max_min_luma_transform_block_size
            .ue(0) // max_transform_hierarchy_depth_inter
            .ue(0) // max_transform_hierarchy_depth_intra
            .u(0, 1) // scaling_list_enabled_flag
            .u(0, 2) // amp_enabled_flag, sample_adaptive_offset_enabled_flag
            .u(0, 1) // pcm_enabled_flag
            .ue(0) // num_short_term_ref_pic_sets
            .u(0, 1) // long_term_ref_pics_present_flag
            .u(0, 2) // sps_temporal_mvp_enabled_flag, strong_intra_smoothing
            .u(1, 1) // vui_parameters_present_flag
            .u(0, 1) // aspect_ratio_info_present_flag
            .u(0, 1) // overscan_info_present_flag
            .u(1, 1) // video_signal_type_present_flag
            .u(5, 3) // video_format = unspecified
            .u(full_range as u32, 1)
            .u(1, 1) // colour_description_present_flag
            .u(primaries as u32, 8)
            .u(transfer as u32, 8)
            .u(matrix as u32, 8);
        sps.into_nalu()
    }

    #[test]
    fn extracts_vui_color_description() {
        let nalu = build_sps(9, 16, 9, true);
        let aspects = parse_color_aspects(&nalu).unwrap().unwrap();
        assert_eq!(aspects.primaries, 9);
        assert_eq!(aspects.transfer, 16);
        assert_eq!(aspects.matrix, 9);
        assert!(aspects.full_range);
    }

    #[test]
    fn sublayer_count_out_of_range_is_malformed() {
        let mut sps = SpsBits::default();
        sps.u(0, 4) // sps_video_parameter_set_id
            .u(7, 3) // sps_max_sub_layers_minus1, beyond the limit of 6
            .u(1, 1) // sps_temporal_id_nesting_flag
            .u(0, 31)
            .u(0, 31)
            .u(0, 31)
            .u(0, 3); // profile_tier_level fixed bits
        assert!(matches!(
            parse_color_aspects(&sps.into_nalu()),
            Err(ParseError::MalformedStream(_))
        ));
    }

    #[test]
    fn too_many_short_term_ref_pic_sets_is_malformed() {
        let mut sps = SpsBits::default();
        sps.u(0, 4)
            .u(0, 3)
            .u(1, 1)
            .u(0, 31)
            .u(0, 31)
            .u(0, 31)
            .u(0, 3)
            .ue(0) // sps_seq_parameter_set_id
            .ue(1) // chroma_format_idc
            .ue(64) // pic_width_in_luma_samples
            .ue(64) // pic_height_in_luma_samples
            .u(0, 1) // conformance_window_flag
            .ue(0)
            .ue(0) // bit depths
            .ue(0) // log2_max_pic_order_cnt_lsb_minus4
            .u(0, 1) // sps_sub_layer_ordering_info_present_flag
            .ue(4)
            .ue(0)
            .ue(0) // sublayer ordering
            .ue(0)
            .ue(3)
            .ue(0)
            .ue(3)
            .ue(0)
            .ue(0) // coding block parameters
            .u(0, 1) // scaling_list_enabled_flag
            .u(0, 2) // amp, sao
            .u(0, 1) // pcm_enabled_flag
            .ue(65); // num_short_term_ref_pic_sets
        assert_eq!(
            parse_color_aspects(&sps.into_nalu()),
            Err(ParseError::MalformedStream(
                "num_short_term_ref_pic_sets out of range"
            ))
        );
    }

    #[test]
    fn truncation_is_insufficient_data() {
        let nalu = build_sps(1, 1, 1, false);
        assert_eq!(
            parse_color_aspects(&nalu[..nalu.len() - 3]),
            Err(ParseError::InsufficientData)
        );
        assert_eq!(parse_color_aspects(&[0x42]), Err(ParseError::InsufficientData));
    }

    #[test]
    fn locates_sps_in_stream() {
        let mut stream = vec![0x00, 0x00, 0x00, 0x01];
        stream.extend_from_slice(&build_sps(9, 16, 9, true));
        let mut walker = NaluWalker::hevc(&stream);
        assert!(walker.locate_sps());
        let aspects = parse_color_aspects(walker.nalu()).unwrap().unwrap();
        assert_eq!(aspects.transfer, 16);
    }
}
