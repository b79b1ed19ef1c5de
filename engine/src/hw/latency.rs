/// Host-visible latencies in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Latencies {
    pub input: usize,
    pub output: usize,
}

/// Input waits one period in the fill region; output additionally sits in
/// the device FIFO.
pub fn latencies(period_frames: usize, fifo_frames: usize) -> Latencies {
    Latencies {
        input: period_frames,
        output: period_frames + fifo_frames,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_includes_fifo() {
        assert_eq!(
            latencies(128, 64),
            Latencies {
                input: 128,
                output: 192
            }
        );
    }
}
