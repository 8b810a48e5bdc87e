//! `AVF1` encoding and decoding

use super::{FRAME_MAGIC, FrameError, HEADER_LEN};
use crate::analysis::AnalysisSnapshot;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A decoded frame, as a client sees it
#[derive(Debug, Clone, PartialEq)]
pub struct WireFrame {
    pub frame_id: u32,
    pub timestamp: f64,
    pub channels: u16,
    pub time_domain_len: u16,
    pub rms: Vec<f32>,
    pub peak: Vec<f32>,
    /// NaN when the snapshot had no correlation
    pub correlation: f32,
    pub time_domain: Vec<f32>,
    pub spectrum: Vec<f32>,
}

/// Encode a snapshot. Lengths that do not fit the `u16` header fields are truncated,
/// and per-channel arrays are padded or cut to the channel count so the frame is
/// always self-consistent.
pub fn encode_frame(snapshot: &AnalysisSnapshot) -> Bytes {
    let channels = snapshot.channels as usize;
    let td_len = snapshot.time_domain_len.min(u16::MAX as usize);
    let td_samples = (td_len * channels).min(snapshot.time_domain.len());
    let td_len = td_samples.checked_div(channels).unwrap_or(0);
    let spectrum_len = snapshot.spectrum.len().min(u16::MAX as usize);

    let payload = 4 * (2 * channels + 1 + td_len * channels + spectrum_len);
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload);

    buf.put_slice(FRAME_MAGIC);
    // Ids are u64 internally, the wire carries the low 32 bits
    buf.put_u32_le(snapshot.id as u32);
    buf.put_f64_le(snapshot.timestamp);
    buf.put_u16_le(snapshot.channels);
    buf.put_u16_le(td_len as u16);
    buf.put_u16_le(spectrum_len as u16);
    buf.put_u16_le(0);

    put_per_channel(&mut buf, &snapshot.metrics.rms, channels);
    put_per_channel(&mut buf, &snapshot.metrics.peak, channels);
    buf.put_f32_le(snapshot.metrics.correlation.unwrap_or(f32::NAN));

    for &sample in &snapshot.time_domain[..td_len * channels] {
        buf.put_f32_le(sample);
    }
    for &bin in &snapshot.spectrum[..spectrum_len] {
        buf.put_f32_le(bin);
    }

    buf.freeze()
}

fn put_per_channel(buf: &mut BytesMut, values: &[f32], channels: usize) {
    for c in 0..channels {
        buf.put_f32_le(values.get(c).copied().unwrap_or(0.0));
    }
}

/// Decode one complete frame
pub fn decode_frame(frame: &[u8]) -> Result<WireFrame, FrameError> {
    if frame.len() < 4 {
        return Err(FrameError::Truncated {
            needed: HEADER_LEN,
            actual: frame.len(),
        });
    }
    let magic = [frame[0], frame[1], frame[2], frame[3]];
    if &magic != FRAME_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    if frame.len() < HEADER_LEN {
        return Err(FrameError::Truncated {
            needed: HEADER_LEN,
            actual: frame.len(),
        });
    }

    let mut buf = &frame[4..];
    let frame_id = buf.get_u32_le();
    let timestamp = buf.get_f64_le();
    let channels = buf.get_u16_le();
    let time_domain_len = buf.get_u16_le();
    let spectrum_len = buf.get_u16_le();
    let reserved = buf.get_u16_le();
    if reserved != 0 {
        return Err(FrameError::Reserved(reserved));
    }

    let c = channels as usize;
    let td_samples = time_domain_len as usize * c;
    let needed = HEADER_LEN + 4 * (2 * c + 1 + td_samples + spectrum_len as usize);
    if frame.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            actual: frame.len(),
        });
    }
    if frame.len() > needed {
        return Err(FrameError::TrailingBytes(frame.len() - needed));
    }

    let rms = get_f32s(&mut buf, c);
    let peak = get_f32s(&mut buf, c);
    let correlation = buf.get_f32_le();
    let time_domain = get_f32s(&mut buf, td_samples);
    let spectrum = get_f32s(&mut buf, spectrum_len as usize);

    Ok(WireFrame {
        frame_id,
        timestamp,
        channels,
        time_domain_len,
        rms,
        peak,
        correlation,
        time_domain,
        spectrum,
    })
}

/// Frame id from an encoded frame's header, without decoding the payload
pub fn frame_id(frame: &[u8]) -> Option<u32> {
    if frame.len() < HEADER_LEN || &frame[..4] != FRAME_MAGIC {
        return None;
    }
    let mut id = &frame[4..8];
    Some(id.get_u32_le())
}

fn get_f32s(buf: &mut &[u8], count: usize) -> Vec<f32> {
    (0..count).map(|_| buf.get_f32_le()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Metrics;

    fn snapshot() -> AnalysisSnapshot {
        AnalysisSnapshot {
            id: 42,
            timestamp: 1.25,
            channels: 2,
            sample_rate: 48000,
            time_domain_len: 3,
            time_domain: vec![0.1, -0.1, 0.2, -0.2, f32::NAN, 0.3],
            spectrum: vec![0.0, 0.5, 0.25, 1e-9, f32::INFINITY],
            metrics: Metrics {
                rms: vec![0.3, 0.4],
                peak: vec![0.9, -0.0],
                correlation: Some(-1.0),
            },
        }
    }

    fn bits(values: &[f32]) -> Vec<u32> {
        values.iter().map(|v| v.to_bits()).collect()
    }

    #[test]
    fn test_header_layout() {
        let encoded = encode_frame(&snapshot());
        assert_eq!(&encoded[..4], b"AVF1");
        assert_eq!(&encoded[4..8], &42u32.to_le_bytes());
        assert_eq!(&encoded[8..16], &1.25f64.to_le_bytes());
        assert_eq!(&encoded[16..18], &2u16.to_le_bytes());
        assert_eq!(&encoded[18..20], &3u16.to_le_bytes());
        assert_eq!(&encoded[20..22], &5u16.to_le_bytes());
        assert_eq!(&encoded[22..24], &[0, 0]);
        assert_eq!(encoded.len(), HEADER_LEN + 4 * (2 + 2 + 1 + 6 + 5));
    }

    #[test]
    fn test_roundtrip_is_bit_exact() {
        let snap = snapshot();
        let decoded = decode_frame(&encode_frame(&snap)).unwrap();

        assert_eq!(decoded.frame_id, 42);
        assert_eq!(decoded.timestamp.to_bits(), snap.timestamp.to_bits());
        assert_eq!(decoded.channels, 2);
        assert_eq!(decoded.time_domain_len, 3);
        assert_eq!(bits(&decoded.rms), bits(&snap.metrics.rms));
        assert_eq!(bits(&decoded.peak), bits(&snap.metrics.peak));
        assert_eq!(decoded.correlation, -1.0);
        assert_eq!(bits(&decoded.time_domain), bits(&snap.time_domain));
        assert_eq!(bits(&decoded.spectrum), bits(&snap.spectrum));
    }

    #[test]
    fn test_absent_correlation_is_nan() {
        let mut snap = snapshot();
        snap.metrics.correlation = None;
        let decoded = decode_frame(&encode_frame(&snap)).unwrap();
        assert!(decoded.correlation.is_nan());
    }

    #[test]
    fn test_frame_id_keeps_low_bits() {
        let mut snap = snapshot();
        snap.id = (7u64 << 32) | 9;
        let decoded = decode_frame(&encode_frame(&snap)).unwrap();
        assert_eq!(decoded.frame_id, 9);
    }

    #[test]
    fn test_short_metric_arrays_are_padded() {
        let mut snap = snapshot();
        snap.metrics.rms = vec![0.5];
        snap.metrics.peak.clear();
        let decoded = decode_frame(&encode_frame(&snap)).unwrap();
        assert_eq!(decoded.rms, vec![0.5, 0.0]);
        assert_eq!(decoded.peak, vec![0.0, 0.0]);
    }

    #[test]
    fn test_frame_id_peek() {
        let encoded = encode_frame(&snapshot());
        assert_eq!(frame_id(&encoded), Some(42));
        assert_eq!(frame_id(&encoded[..8]), None);
        assert_eq!(frame_id(b"XVF1xxxxxxxxxxxxxxxxxxxxxxxx"), None);
    }

    #[test]
    fn test_bad_magic() {
        let mut encoded = encode_frame(&snapshot()).to_vec();
        encoded[0] = b'X';
        assert_eq!(decode_frame(&encoded), Err(FrameError::BadMagic(*b"XVF1")));
    }

    #[test]
    fn test_truncated_and_trailing() {
        let encoded = encode_frame(&snapshot()).to_vec();

        let err = decode_frame(&encoded[..10]).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { needed: HEADER_LEN, actual: 10 }));

        let err = decode_frame(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { .. }));

        let mut long = encoded.clone();
        long.extend_from_slice(&[0, 0]);
        assert_eq!(decode_frame(&long), Err(FrameError::TrailingBytes(2)));
    }

    #[test]
    fn test_nonzero_reserved() {
        let mut encoded = encode_frame(&snapshot()).to_vec();
        encoded[22] = 1;
        assert_eq!(decode_frame(&encoded), Err(FrameError::Reserved(1)));
    }
}
