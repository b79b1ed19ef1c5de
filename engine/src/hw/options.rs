use crate::hw::usb::pipeline::PadPolicy;
use crate::settings::Settings;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct HwOptions {
    pub input_channels: usize,
    pub output_channels: usize,
    pub period_frames: usize,
    pub fifo_frames: usize,
    /// Transfers kept in flight per direction.
    pub transfers: usize,
    /// Nominal frames per isochronous packet.
    pub packet_frames: usize,
    /// Time without a rotation after which the fill region is padded.
    /// `None` means two periods at the negotiated sample rate.
    pub watchdog: Option<Duration>,
    pub stop_timeout: Duration,
    pub pad: PadPolicy,
}

impl Default for HwOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl HwOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            input_channels: settings.input_channels(),
            output_channels: settings.output_channels(),
            period_frames: settings.period_frames(),
            fifo_frames: settings.fifo_frames(),
            transfers: 8,
            packet_frames: 16,
            watchdog: None,
            stop_timeout: Duration::from_millis(500),
            pad: PadPolicy::Silence,
        }
    }

    pub fn watchdog_for(&self, sample_rate: u32) -> Duration {
        self.watchdog.unwrap_or_else(|| {
            let rate = u64::from(sample_rate.max(1));
            let nanos = (self.period_frames as u64 * 2).saturating_mul(1_000_000_000) / rate;
            Duration::from_nanos(nanos.max(1_000_000))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_watchdog_spans_two_periods() {
        let opts = HwOptions::default();
        assert_eq!(opts.period_frames, 64);
        let wd = opts.watchdog_for(48_000);
        assert_eq!(wd.as_micros(), 2_666);
    }

    #[test]
    fn explicit_watchdog_wins() {
        let opts = HwOptions {
            watchdog: Some(Duration::from_millis(7)),
            ..HwOptions::default()
        };
        assert_eq!(opts.watchdog_for(48_000), Duration::from_millis(7));
    }
}
