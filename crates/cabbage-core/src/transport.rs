//! Host transport information.
//!
//! Hosts report tempo, time signature and play state per block. The
//! adapter forwards them to the orchestra through a fixed set of reserved
//! channels, but only those the orchestra actually declares.

/// Channel names reserved for host transport values.
pub mod channels {
    pub const HOST_BPM: &str = "HOST_BPM";
    pub const IS_PLAYING: &str = "IS_PLAYING";
    pub const IS_RECORDING: &str = "IS_RECORDING";
    pub const TIME_IN_SAMPLES: &str = "TIME_IN_SAMPLES";
    pub const TIME_IN_SECONDS: &str = "TIME_IN_SECONDS";
    pub const HOST_PPQ_POS: &str = "HOST_PPQ_POS";
    pub const TIME_SIG_NUM: &str = "TIME_SIG_NUM";
    pub const TIME_SIG_DENOM: &str = "TIME_SIG_DENOM";

    /// Every reserved name, in the order of [`super::Transport::channel_values`].
    pub const ALL: [&str; 8] = [
        HOST_BPM,
        IS_PLAYING,
        IS_RECORDING,
        TIME_IN_SAMPLES,
        TIME_IN_SECONDS,
        HOST_PPQ_POS,
        TIME_SIG_NUM,
        TIME_SIG_DENOM,
    ];
}

/// Host transport state for one block. Fields the host does not know are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Transport {
    pub tempo: Option<f64>,
    pub time_sig_numerator: Option<u32>,
    pub time_sig_denominator: Option<u32>,
    /// Position in quarter notes.
    pub ppq_position: Option<f64>,
    /// Position in samples.
    pub sample_position: Option<u64>,
    pub is_playing: bool,
    pub is_recording: bool,
}

impl Transport {
    /// Values for the reserved channels, in [`channels::ALL`] order.
    ///
    /// `fallback_position` is the adapter's own running sample count,
    /// used when the host does not report a position.
    pub fn channel_values(&self, sample_rate: f64, fallback_position: u64) -> [f64; 8] {
        let samples = self.sample_position.unwrap_or(fallback_position) as f64;
        let seconds = if sample_rate > 0.0 {
            samples / sample_rate
        } else {
            0.0
        };
        [
            self.tempo.unwrap_or(120.0),
            if self.is_playing { 1.0 } else { 0.0 },
            if self.is_recording { 1.0 } else { 0.0 },
            samples,
            seconds,
            self.ppq_position.unwrap_or(0.0),
            f64::from(self.time_sig_numerator.unwrap_or(4)),
            f64::from(self.time_sig_denominator.unwrap_or(4)),
        ]
    }
}
