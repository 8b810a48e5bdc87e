//! Time-domain level metrics over an interleaved window

/// Per-channel RMS and peak amplitude of an interleaved window
pub fn channel_levels(window: &[f32], channels: usize) -> (Vec<f32>, Vec<f32>) {
    let channels = channels.max(1);
    let mut sum_sq = vec![0.0f64; channels];
    let mut peak = vec![0.0f32; channels];

    for frame in window.chunks_exact(channels) {
        for (c, &sample) in frame.iter().enumerate() {
            sum_sq[c] += f64::from(sample) * f64::from(sample);
            peak[c] = peak[c].max(sample.abs());
        }
    }

    let frames = window.len() / channels;
    let rms = sum_sq
        .iter()
        .map(|&s| {
            if frames == 0 {
                0.0
            } else {
                (s / frames as f64).sqrt() as f32
            }
        })
        .collect();

    (rms, peak)
}

/// Pearson correlation between the first two channels.
///
/// `None` for mono input, or when either channel is constant over the window.
pub fn correlation(window: &[f32], channels: usize) -> Option<f32> {
    if channels < 2 {
        return None;
    }

    let frames = window.len() / channels;
    if frames == 0 {
        return None;
    }

    let (mut mean_l, mut mean_r) = (0.0f64, 0.0f64);
    for frame in window.chunks_exact(channels) {
        mean_l += f64::from(frame[0]);
        mean_r += f64::from(frame[1]);
    }
    mean_l /= frames as f64;
    mean_r /= frames as f64;

    let (mut cross, mut energy_l, mut energy_r) = (0.0f64, 0.0f64, 0.0f64);
    for frame in window.chunks_exact(channels) {
        let l = f64::from(frame[0]) - mean_l;
        let r = f64::from(frame[1]) - mean_r;
        cross += l * r;
        energy_l += l * l;
        energy_r += r * r;
    }

    let denom = (energy_l * energy_r).sqrt();
    if denom <= 1e-12 {
        return None;
    }
    Some((cross / denom).clamp(-1.0, 1.0) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_levels_are_exactly_zero() {
        let (rms, peak) = channel_levels(&[0.0; 512], 1);
        assert_eq!(rms, vec![0.0]);
        assert_eq!(peak, vec![0.0]);
    }

    #[test]
    fn test_levels_are_per_channel() {
        // Left constant 0.5, right alternating +-1.0
        let window: Vec<f32> = (0..64)
            .flat_map(|i| [0.5, if i % 2 == 0 { 1.0 } else { -1.0 }])
            .collect();
        let (rms, peak) = channel_levels(&window, 2);

        assert!((rms[0] - 0.5).abs() < 1e-6);
        assert!((rms[1] - 1.0).abs() < 1e-6);
        assert_eq!(peak, vec![0.5, 1.0]);
    }

    #[test]
    fn test_mono_has_no_correlation() {
        assert_eq!(correlation(&[0.1, 0.2, 0.3], 1), None);
    }

    #[test]
    fn test_identical_and_inverted_channels() {
        let signal: Vec<f32> = (0..256).map(|i| (i as f32 * 0.1).sin()).collect();

        let same: Vec<f32> = signal.iter().flat_map(|&s| [s, s]).collect();
        let inverted: Vec<f32> = signal.iter().flat_map(|&s| [s, -s]).collect();

        assert!((correlation(&same, 2).unwrap() - 1.0).abs() < 1e-5);
        assert!((correlation(&inverted, 2).unwrap() + 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_silent_stereo_has_no_correlation() {
        assert_eq!(correlation(&[0.0; 128], 2), None);
    }
}
