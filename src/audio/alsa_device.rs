//! ALSA PCM device wrappers and sound card enumeration.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use crate::hardware::{AudioRoute, PortKind, RoutePort};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

/// Open a PCM device for capture (recording).
pub fn open_capture(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Capture, sample_rate, channels, period_size, "Capture")
}

/// Open a PCM device for playback.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    open_pcm(
        device,
        Direction::Playback,
        sample_rate,
        channels,
        period_size,
        "Playback",
    )
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
    dir_name: &str,
) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let (actual_rate, actual_channels, period_size) = {
        let hwp = pcm.hw_params_current()?;
        let rate = hwp.get_rate()?;
        let ch = hwp.get_channels()?;
        let ps = hwp.get_period_size()? as usize;
        (rate, ch, ps)
    };

    let params = AlsaParams {
        sample_rate: actual_rate,
        channels: actual_channels,
        period_size,
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        actual_rate,
        actual_channels,
        period_size,
    );

    Ok((pcm, params))
}

/// Check that `device` can be opened in `direction` and release it right away.
pub fn probe(device: &str, direction: Direction) -> Result<()> {
    let dir_name = match direction {
        Direction::Capture => "Capture",
        Direction::Playback => "Playback",
    };
    PCM::new(device, direction, false)
        .map(drop)
        .with_context(|| format!("PCM device '{}' unavailable for {}", device, dir_name))
}

/// Whether opening the capture device failed because access was refused.
pub fn is_access_denied(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<alsa::Error>())
        .any(|e| matches!(e.errno(), EACCES | EPERM))
}

const EPERM: i32 = 1;
const EACCES: i32 = 13;

/// A sound card as seen by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub index: i32,
    pub name: String,
    pub long_name: String,
}

impl CardInfo {
    pub fn port_kind(&self) -> PortKind {
        let text = format!("{} {}", self.name, self.long_name).to_lowercase();
        if text.contains("bluez") || text.contains("bluetooth") {
            PortKind::BluetoothA2dp
        } else if text.contains("headphone") || text.contains("headset") {
            PortKind::Headphones
        } else if text.contains("hdmi") {
            PortKind::Hdmi
        } else if text.contains("usb") {
            PortKind::Usb
        } else {
            PortKind::BuiltInSpeaker
        }
    }
}

pub fn list_cards() -> Vec<CardInfo> {
    let mut cards = Vec::new();
    for card in alsa::card::Iter::new() {
        let card = match card {
            Ok(card) => card,
            Err(e) => {
                log::warn!("Failed to enumerate sound card: {}", e);
                continue;
            }
        };
        cards.push(CardInfo {
            index: card.get_index(),
            name: card.get_name().unwrap_or_default(),
            long_name: card.get_longname().unwrap_or_default(),
        });
    }
    cards
}

/// Build a route from the card list. Headphone-class cards come first, then USB,
/// then everything else; the first output is the active one.
pub fn route_from_cards(cards: &[CardInfo]) -> AudioRoute {
    let mut outputs: Vec<RoutePort> = cards
        .iter()
        .map(|card| RoutePort::new(card.name.clone(), card.port_kind()))
        .collect();
    outputs.sort_by_key(|port| match port.kind {
        kind if kind.is_external_output() => 0,
        PortKind::Usb => 1,
        _ => 2,
    });

    let inputs = cards
        .iter()
        .take(1)
        .map(|card| RoutePort::new(card.name.clone(), PortKind::BuiltInMic))
        .collect();

    AudioRoute { inputs, outputs }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(index: i32, name: &str, long_name: &str) -> CardInfo {
        CardInfo {
            index,
            name: name.to_string(),
            long_name: long_name.to_string(),
        }
    }

    #[test]
    fn classifies_cards_by_name() {
        assert_eq!(
            card(0, "PCH", "HDA Intel PCH").port_kind(),
            PortKind::BuiltInSpeaker
        );
        assert_eq!(card(1, "HDMI", "HDA Intel HDMI").port_kind(), PortKind::Hdmi);
        assert_eq!(
            card(2, "Headset", "USB Headset").port_kind(),
            PortKind::Headphones
        );
        assert_eq!(card(3, "Device", "USB Audio Device").port_kind(), PortKind::Usb);
    }

    #[test]
    fn external_cards_become_the_active_output() {
        let cards = vec![
            card(0, "PCH", "HDA Intel PCH"),
            card(1, "Headset", "USB Headset"),
        ];
        let route = route_from_cards(&cards);
        assert_eq!(route.name(), "Headset");
        assert!(route.has_external_output());
        assert_eq!(route.inputs.len(), 1);

        let route = route_from_cards(&cards[..1]);
        assert_eq!(route.name(), "PCH");
        assert!(!route.has_external_output());
    }
}
