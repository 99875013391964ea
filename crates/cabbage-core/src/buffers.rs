//! Pre-allocated per-channel sample buffers for the engine.
//!
//! The host hands the processor `f32` channels of whatever count it has;
//! the engine wants exactly its own input and output channel counts in
//! `f64`. `BlockBuffers` holds that engine-shaped layout so host audio can
//! be copied in (zero-padding missing channels) and copied back out
//! (dropping extra ones) without allocating.
//!
//! # Real-Time Safety
//!
//! - All buffers are allocated in [`BlockBuffers::allocate`], called from `prepare`
//! - Nothing in the copy helpers allocates
//! - Blocks longer than `max_frames` are the caller's to split

/// Engine-shaped input and output buffers: `[channel][sample]`.
#[derive(Debug, Default)]
pub struct BlockBuffers {
    pub inputs: Vec<Vec<f64>>,
    pub outputs: Vec<Vec<f64>>,
    max_frames: usize,
}

impl BlockBuffers {
    /// Empty buffers. Nothing can be processed until [`allocate`](Self::allocate).
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `inputs x max_frames` and `outputs x max_frames` samples.
    pub fn allocate(inputs: usize, outputs: usize, max_frames: usize) -> Self {
        Self {
            inputs: (0..inputs).map(|_| vec![0.0; max_frames]).collect(),
            outputs: (0..outputs).map(|_| vec![0.0; max_frames]).collect(),
            max_frames,
        }
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn is_allocated(&self) -> bool {
        self.max_frames > 0
    }

    /// Copy host channels into the engine inputs.
    ///
    /// Engine channels without a host counterpart are zeroed; host channels
    /// beyond the engine's count are ignored. `frames` is clamped to
    /// `max_frames`.
    pub fn load_inputs(&mut self, host: &[&mut [f32]], offset: usize, frames: usize) {
        let frames = frames.min(self.max_frames);
        for (ch, input) in self.inputs.iter_mut().enumerate() {
            match host.get(ch) {
                Some(src) => {
                    let src = src.get(offset..offset + frames).unwrap_or(&[]);
                    for (dst, &s) in input.iter_mut().zip(src) {
                        *dst = f64::from(s);
                    }
                    input[src.len()..frames].fill(0.0);
                }
                None => input[..frames].fill(0.0),
            }
        }
    }

    /// Copy engine outputs back into host channels.
    ///
    /// Host channels without an engine counterpart are zeroed.
    pub fn store_outputs(&self, host: &mut [&mut [f32]], offset: usize, frames: usize) {
        let frames = frames.min(self.max_frames);
        for (ch, dst) in host.iter_mut().enumerate() {
            let Some(dst) = dst.get_mut(offset..offset + frames) else {
                continue;
            };
            match self.outputs.get(ch) {
                Some(src) => {
                    for (d, &s) in dst.iter_mut().zip(src) {
                        *d = s as f32;
                    }
                }
                None => dst.fill(0.0),
            }
        }
    }

    /// Zero the first `frames` samples of every output.
    pub fn clear_outputs(&mut self, frames: usize) {
        let frames = frames.min(self.max_frames);
        for out in &mut self.outputs {
            out[..frames].fill(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate() {
        let buffers = BlockBuffers::allocate(1, 2, 64);
        assert_eq!(buffers.inputs.len(), 1);
        assert_eq!(buffers.outputs.len(), 2);
        assert_eq!(buffers.outputs[1].len(), 64);
        assert!(buffers.is_allocated());
        assert!(!BlockBuffers::new().is_allocated());
    }

    #[test]
    fn test_load_inputs_zero_pads_missing_channels() {
        let mut buffers = BlockBuffers::allocate(3, 0, 4);
        buffers.inputs[2].fill(9.0);
        let mut left = [0.5f32; 4];
        let mut host: [&mut [f32]; 1] = [&mut left];
        buffers.load_inputs(&mut host, 0, 4);
        assert_eq!(buffers.inputs[0], vec![0.5; 4]);
        assert_eq!(buffers.inputs[1], vec![0.0; 4]);
        assert_eq!(buffers.inputs[2], vec![0.0; 4]);
    }

    #[test]
    fn test_store_outputs_truncates_and_zeroes() {
        let mut buffers = BlockBuffers::allocate(0, 1, 4);
        buffers.outputs[0].copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        let mut left = [0.0f32; 4];
        let mut right = [7.0f32; 4];
        let mut host: [&mut [f32]; 2] = [&mut left, &mut right];
        buffers.store_outputs(&mut host, 0, 4);
        assert_eq!(left, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(right, [0.0; 4]);
    }

    #[test]
    fn test_offset_copy() {
        let mut buffers = BlockBuffers::allocate(1, 1, 2);
        let mut ch = [1.0f32, 2.0, 3.0, 4.0];
        {
            let mut host: [&mut [f32]; 1] = [&mut ch];
            buffers.load_inputs(&mut host, 2, 2);
        }
        assert_eq!(buffers.inputs[0], vec![3.0, 4.0]);
        buffers.outputs[0].copy_from_slice(&[8.0, 9.0]);
        let mut host: [&mut [f32]; 1] = [&mut ch];
        buffers.store_outputs(&mut host, 2, 2);
        assert_eq!(ch, [1.0, 2.0, 8.0, 9.0]);
    }
}
