//! Frame-change detection for the adaptive frame-rate controller.
//!
//! Neither capture pipeline exposes per-frame damage metadata in a form
//! we can consume cheaply, so change detection is done on the captured
//! BGRA bytes themselves: a sparse FNV-1a digest over a fixed sampling
//! grid. Two frames with equal digests are treated as unchanged. The
//! sampling grid is deterministic, so the signal is reproducible for a
//! given frame sequence.

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Horizontal sampling step in pixels (4 bytes each).
const PIXEL_STEP: usize = 16;
/// Number of rows sampled regardless of frame height.
const SAMPLED_ROWS: usize = 64;

/// Sparse digest of one BGRA frame.
pub fn frame_digest(data: &[u8], width: u32, height: u32, stride: u32) -> u64 {
    let mut hash = FNV_OFFSET;
    let row_step = (height as usize / SAMPLED_ROWS).max(1);
    let row_bytes = (width as usize) * 4;

    let mut y = 0usize;
    while y < height as usize {
        let row_start = y * stride as usize;
        let row = &data[row_start..row_start + row_bytes.min(data.len() - row_start)];

        let mut x = 0usize;
        while x + 4 <= row.len() {
            for &b in &row[x..x + 4] {
                hash ^= b as u64;
                hash = hash.wrapping_mul(FNV_PRIME);
            }
            x += PIXEL_STEP * 4;
        }
        y += row_step;
    }
    hash
}

/// Remembers the previous frame's digest and reports whether the current
/// frame differs. The first frame after construction or [`reset`]
/// always counts as changed.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    previous: Option<u64>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Digest the frame and compare against the previous one.
    pub fn observe(&mut self, data: &[u8], width: u32, height: u32, stride: u32) -> bool {
        let digest = frame_digest(data, width, height, stride);
        let changed = self.previous != Some(digest);
        self.previous = Some(digest);
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32, value: u8) -> Vec<u8> {
        vec![value; (width * height * 4) as usize]
    }

    #[test]
    fn first_frame_counts_as_changed() {
        let mut detector = ChangeDetector::new();
        let frame = solid_frame(64, 64, 0x10);
        assert!(detector.observe(&frame, 64, 64, 256));
    }

    #[test]
    fn identical_frames_do_not_change() {
        let mut detector = ChangeDetector::new();
        let frame = solid_frame(64, 64, 0x10);
        detector.observe(&frame, 64, 64, 256);
        assert!(!detector.observe(&frame, 64, 64, 256));
        assert!(!detector.observe(&frame, 64, 64, 256));
    }

    #[test]
    fn sampled_pixel_edit_is_detected() {
        let mut detector = ChangeDetector::new();
        let mut frame = solid_frame(64, 64, 0x10);
        detector.observe(&frame, 64, 64, 256);

        // First sampled pixel of the first sampled row.
        frame[0] = 0xFF;
        assert!(detector.observe(&frame, 64, 64, 256));
    }

    #[test]
    fn reset_forces_a_change() {
        let mut detector = ChangeDetector::new();
        let frame = solid_frame(32, 32, 0x42);
        detector.observe(&frame, 32, 32, 128);
        detector.reset();
        assert!(detector.observe(&frame, 32, 32, 128));
    }

    #[test]
    fn digest_is_deterministic() {
        let frame = solid_frame(128, 128, 0x77);
        let a = frame_digest(&frame, 128, 128, 512);
        let b = frame_digest(&frame, 128, 128, 512);
        assert_eq!(a, b);
    }

    #[test]
    fn digest_respects_stride_padding() {
        // Same pixels, different padding bytes: the digest only reads
        // the visible row prefix, so padding must not matter.
        let width = 16u32;
        let height = 16u32;
        let stride = 80u32; // 64 visible + 16 padding
        let mut a = vec![0u8; (stride * height) as usize];
        let mut b = vec![0u8; (stride * height) as usize];
        for row in 0..height as usize {
            for i in 0..(width as usize * 4) {
                a[row * stride as usize + i] = (row + i) as u8;
                b[row * stride as usize + i] = (row + i) as u8;
            }
            // Different padding.
            b[row * stride as usize + 70] = 0xAB;
        }
        assert_eq!(frame_digest(&a, width, height, stride), frame_digest(&b, width, height, stride));
    }
}
