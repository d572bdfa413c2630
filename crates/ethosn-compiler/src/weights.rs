//! Weight layout conversion, encoding, and the encoder cache.
//!
//! The compression algorithm itself belongs to the external encoder; this
//! module owns its *contract*: deterministic output, per-stripe metadata, and
//! a `max_slot_size` that sizes the weight SRAM tile. The cache memoises on
//! the full parameter tuple and never evicts within one compilation.

use std::collections::HashMap;
use std::rc::Rc;

use bytes::{BufMut, Bytes, BytesMut};
use ethosn_command_stream::MceOperation;

use crate::tensor::{QuantizationInfo, TensorShape};

/// Swizzle convolution weights from OHWI to HWIO.
///
/// `shape` is the source `(O, H, W, I)` extent; the output iterates H, W, I
/// with O fastest.
pub fn swizzle_ohwi_to_hwio(input: &[u8], shape: TensorShape) -> Vec<u8> {
    let [o_dim, h_dim, w_dim, i_dim] = shape.0.map(|d| d as usize);
    let mut out = vec![0u8; input.len()];
    for h in 0..h_dim {
        for w in 0..w_dim {
            for i in 0..i_dim {
                for o in 0..o_dim {
                    let src = ((o * h_dim + h) * w_dim + w) * i_dim + i;
                    let dst = ((h * w_dim + w) * i_dim + i) * o_dim + o;
                    out[dst] = input[src];
                }
            }
        }
    }
    out
}

/// Swizzle convolution weights from OIHW to HWIO.
///
/// `shape` is the source `(O, I, H, W)` extent.
pub fn swizzle_oihw_to_hwio(input: &[u8], shape: TensorShape) -> Vec<u8> {
    let [o_dim, i_dim, h_dim, w_dim] = shape.0.map(|d| d as usize);
    let mut out = vec![0u8; input.len()];
    for h in 0..h_dim {
        for w in 0..w_dim {
            for i in 0..i_dim {
                for o in 0..o_dim {
                    let src = ((o * i_dim + i) * h_dim + h) * w_dim + w;
                    let dst = ((h * w_dim + w) * i_dim + i) * o_dim + o;
                    out[dst] = input[src];
                }
            }
        }
    }
    out
}

/// Full parameter tuple the encoder output depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WeightEncodeParams {
    /// Weight bytes, already in HWIO (or HWIM for depthwise) order.
    pub weights: Bytes,
    /// Weight tensor shape.
    pub weights_shape: TensorShape,
    /// Weight quantisation.
    pub weights_quant: QuantizationInfo,
    /// Bias values, one per output channel.
    pub bias: Vec<i32>,
    /// Bias quantisation.
    pub bias_quant: QuantizationInfo,
    /// Input feature-map quantisation.
    pub input_quant: QuantizationInfo,
    /// Output feature-map quantisation.
    pub output_quant: QuantizationInfo,
    /// Output channels per weight stripe.
    pub stripe_depth: u32,
    /// Convolution stride `(x, y)`.
    pub stride: (u32, u32),
    /// Leading padding `(left, top)`.
    pub padding: (u32, u32),
    /// IFM depth processed per MCE iteration.
    pub iteration_size: u32,
    /// Operation the weights feed.
    pub operation: MceOperation,
}

/// Offset and size of the weight data for one stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightsMetadata {
    /// Byte offset inside the weight buffer.
    pub offset: u32,
    /// Byte size.
    pub size: u32,
}

/// Encoder output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedWeights {
    /// Encoded payload for all stripes, concatenated.
    pub data: Bytes,
    /// Largest single stripe payload, bytes. Sizes the SRAM slot.
    pub max_slot_size: u32,
    /// Per-stripe `(offset, size)` records.
    pub metadata: Vec<WeightsMetadata>,
}

/// Encode weights for streaming.
///
/// Stand-in for the external compressed format: a fixed header per stripe
/// followed by that stripe's weight and bias bytes. Deterministic in its
/// inputs, which is the property the cache and the tests rely on.
///
/// Returns `None` when the parameters are degenerate (no output channels or
/// a zero stripe depth).
pub fn encode_weights(params: &WeightEncodeParams) -> Option<EncodedWeights> {
    // Weights are HWIO for convolution and HWIM for depthwise, so the OFM
    // count is O, or I*M respectively.
    let ofm_channels = match params.operation {
        MceOperation::DepthwiseConvolution => {
            (params.weights_shape.0[2] * params.weights_shape.0[3]).max(1)
        }
        _ => params.weights_shape.0[3].max(1),
    };
    if params.stripe_depth == 0 || params.weights.is_empty() {
        return None;
    }

    let num_stripes = crate::tensor::div_round_up(ofm_channels, params.stripe_depth);
    let bytes_per_ofm = (params.weights.len() as u32) / ofm_channels;

    let mut data = BytesMut::new();
    let mut metadata = Vec::with_capacity(num_stripes as usize);
    let mut max_slot = 0u32;

    for stripe in 0..num_stripes {
        let first_ofm = stripe * params.stripe_depth;
        let ofms = params.stripe_depth.min(ofm_channels - first_ofm);
        let payload_len = ofms * bytes_per_ofm + ofms * 4;

        let offset = data.len() as u32;
        data.put_u8(b'W');
        data.put_u8(0);
        data.put_u16_le(u16::try_from(stripe).unwrap_or(u16::MAX));
        data.put_u32_le(ofms);
        data.put_u32_le(payload_len);
        data.put_u32_le(params.iteration_size);

        let start = (first_ofm * bytes_per_ofm) as usize;
        let end = ((first_ofm + ofms) * bytes_per_ofm) as usize;
        data.put_slice(&params.weights[start.min(params.weights.len())..end.min(params.weights.len())]);
        for ofm in first_ofm..first_ofm + ofms {
            let bias = params.bias.get(ofm as usize).copied().unwrap_or(0);
            data.put_i32_le(bias);
        }

        let size = data.len() as u32 - offset;
        // Slots are addressed per SRAM in 16-byte beats.
        max_slot = max_slot.max(crate::tensor::round_up(size, 16));
        metadata.push(WeightsMetadata { offset, size });
    }

    Some(EncodedWeights {
        data: data.freeze(),
        max_slot_size: max_slot,
        metadata,
    })
}

/// Memoising adapter over the encoder.
///
/// Owned by one compilation; entries live for its whole duration. Not shared
/// between threads.
#[derive(Debug, Default)]
pub struct WeightEncoderCache {
    entries: HashMap<WeightEncodeParams, Option<Rc<EncodedWeights>>>,
}

impl WeightEncoderCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode through the cache. Two calls with equal parameters return the
    /// same (shared) result.
    pub fn encode(&mut self, params: &WeightEncodeParams) -> Option<Rc<EncodedWeights>> {
        if let Some(hit) = self.entries.get(params) {
            return hit.clone();
        }
        let encoded = encode_weights(params).map(Rc::new);
        self.entries.insert(params.clone(), encoded.clone());
        tracing::trace!(
            "Weight encoder cache miss (stripe_depth={}, {} entries)",
            params.stripe_depth,
            self.entries.len()
        );
        encoded
    }

    /// Number of distinct parameter tuples seen.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no encodings have been requested yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swizzle_ohwi_to_hwio() {
        let shape = TensorShape::new(2, 4, 4, 2);
        let input: Vec<u8> = (1..=64).collect();
        let swizzled = swizzle_ohwi_to_hwio(&input, shape);

        let expected: Vec<u8> = vec![
            1, 33, 2, 34, 3, 35, 4, 36, 5, 37, 6, 38, 7, 39, 8, 40, //
            9, 41, 10, 42, 11, 43, 12, 44, 13, 45, 14, 46, 15, 47, 16, 48, //
            17, 49, 18, 50, 19, 51, 20, 52, 21, 53, 22, 54, 23, 55, 24, 56, //
            25, 57, 26, 58, 27, 59, 28, 60, 29, 61, 30, 62, 31, 63, 32, 64,
        ];
        assert_eq!(swizzled, expected);
    }

    #[test]
    fn test_swizzle_oihw_to_hwio() {
        let shape = TensorShape::new(2, 2, 4, 4);
        let input: Vec<u8> = (1..=64).collect();
        let swizzled = swizzle_oihw_to_hwio(&input, shape);

        let expected: Vec<u8> = vec![
            1, 33, 17, 49, 2, 34, 18, 50, 3, 35, 19, 51, 4, 36, 20, 52, //
            5, 37, 21, 53, 6, 38, 22, 54, 7, 39, 23, 55, 8, 40, 24, 56, //
            9, 41, 25, 57, 10, 42, 26, 58, 11, 43, 27, 59, 12, 44, 28, 60, //
            13, 45, 29, 61, 14, 46, 30, 62, 15, 47, 31, 63, 16, 48, 32, 64,
        ];
        assert_eq!(swizzled, expected);
    }

    fn sample_params(stripe_depth: u32) -> WeightEncodeParams {
        WeightEncodeParams {
            weights: Bytes::from((0u8..=255).cycle().take(3 * 3 * 16 * 32).collect::<Vec<_>>()),
            weights_shape: TensorShape::new(3, 3, 16, 32),
            weights_quant: QuantizationInfo::new(0, 0.5),
            bias: vec![7; 32],
            bias_quant: QuantizationInfo::new(0, 0.25),
            input_quant: QuantizationInfo::new(0, 0.5),
            output_quant: QuantizationInfo::new(0, 0.5),
            stripe_depth,
            stride: (1, 1),
            padding: (1, 1),
            iteration_size: 16,
            operation: MceOperation::Convolution,
        }
    }

    #[test]
    fn test_encoder_is_deterministic() {
        let a = encode_weights(&sample_params(16)).unwrap();
        let b = encode_weights(&sample_params(16)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_encoder_metadata_covers_data() {
        let enc = encode_weights(&sample_params(16)).unwrap();
        assert_eq!(enc.metadata.len(), 2);
        let last = enc.metadata.last().unwrap();
        assert_eq!((last.offset + last.size) as usize, enc.data.len());
        assert!(enc.metadata.iter().all(|m| m.size <= enc.max_slot_size));
    }

    #[test]
    fn test_cache_returns_shared_result() {
        let mut cache = WeightEncoderCache::new();
        let a = cache.encode(&sample_params(16)).unwrap();
        let b = cache.encode(&sample_params(16)).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        let c = cache.encode(&sample_params(8)).unwrap();
        assert_eq!(cache.len(), 2);
        assert_ne!(a.metadata.len(), c.metadata.len());
    }
}
