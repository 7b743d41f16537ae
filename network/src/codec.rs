//! G.711 µ-law (PCMU).

/// RTP clock rate of PCMU
pub const PCMU_RATE: u32 = 8000;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Encode one linear sample in -1.0..=1.0
pub fn encode_sample(sample: f32) -> u8 {
    let pcm = (sample.clamp(-1.0, 1.0) * 32767.0) as i32;
    let sign = if pcm < 0 { 0x80 } else { 0x00 };
    let magnitude = pcm.abs().min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

/// Decode one µ-law byte
pub fn decode_sample(byte: u8) -> f32 {
    let byte = !byte as i32;
    let sign = byte & 0x80;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = byte & 0x0F;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    let pcm = if sign != 0 { -magnitude } else { magnitude };
    pcm as f32 / 32768.0
}

pub fn encode(samples: &[f32]) -> Vec<u8> {
    samples.iter().map(|&s| encode_sample(s)).collect()
}

pub fn decode(bytes: &[u8]) -> Vec<f32> {
    bytes.iter().map(|&b| decode_sample(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_encodes_to_0xff() {
        assert_eq!(encode_sample(0.0), 0xFF);
        assert_eq!(decode_sample(0xFF), 0.0);
    }

    #[test]
    fn companding_error_is_small() {
        for &s in &[0.9f32, 0.5, 0.1, 0.01, -0.01, -0.3, -0.75] {
            let decoded = decode_sample(encode_sample(s));
            assert!(
                (decoded - s).abs() <= s.abs() * 0.07 + 0.001,
                "{} came back as {}",
                s,
                decoded
            );
            assert_eq!(decoded.signum(), s.signum());
        }
    }

    #[test]
    fn out_of_range_input_clips() {
        assert_eq!(encode_sample(4.0), encode_sample(1.0));
        assert_eq!(encode_sample(-4.0), encode_sample(-1.0));
    }
}
