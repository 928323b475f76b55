//! Value types shared by the pipeline core, the wire protocols, and the
//! shared-memory registry. Everything here is `Copy`/plain-old-data where
//! possible: these are exactly the fields that survive a deep copy into shm
//! and a trip through a fixed-layout IPC record.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    V4l2Like,
    TestPattern,
    ArgusLike,
}

impl Default for SourceKind {
    fn default() -> Self {
        SourceKind::TestPattern
    }
}

impl SourceKind {
    /// The kebab-case spelling `clap::ValueEnum` expects on the
    /// `pipeline-worker`/`target-worker` command lines — matches the derive
    /// macro's default renaming, which `{:?}` (PascalCase) does not.
    pub fn cli_str(self) -> &'static str {
        match self {
            SourceKind::V4l2Like => "v4l2-like",
            SourceKind::TestPattern => "test-pattern",
            SourceKind::ArgusLike => "argus-like",
        }
    }
}

/// Selects between the plain software element chain and a hardware-backed
/// variant for the same codec (VAAPI or OMX, depending on platform).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncodingFamily {
    General,
    HwAccelerated,
}

impl Default for EncodingFamily {
    fn default() -> Self {
        EncodingFamily::General
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    H264,
    H265,
}

impl Codec {
    pub fn from_wire(v: u32) -> Option<Codec> {
        match v {
            1 => Some(Codec::H264),
            2 => Some(Codec::H265),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Codec::H264 => 1,
            Codec::H265 => 2,
        }
    }

    /// Kebab-case spelling for the worker binaries' `value_enum` arguments.
    pub fn cli_str(self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
        }
    }
}

/// The concrete encoder element family a (codec, encoding_family) pair
/// resolves to; this is the key the parameter mapper table is indexed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderVariant {
    X264,
    X265,
    Vaapi264,
    Vaapi265,
    Omx264,
    Omx265,
}

impl EncoderVariant {
    pub fn resolve(codec: Codec, family: EncodingFamily) -> EncoderVariant {
        use Codec::*;
        use EncodingFamily::*;
        match (codec, family) {
            (H264, General) => EncoderVariant::X264,
            (H265, General) => EncoderVariant::X265,
            (H264, HwAccelerated) => EncoderVariant::Vaapi264,
            (H265, HwAccelerated) => EncoderVariant::Vaapi265,
        }
    }

    /// Alternate resolution used on OMX-only platforms (Raspberry Pi-style
    /// hardware); selected by a config flag rather than by this function,
    /// which a caller may swap in after `resolve` when `omx` is preferred
    /// over `vaapi` for the hw-accelerated family.
    pub fn omx_variant(codec: Codec) -> EncoderVariant {
        match codec {
            Codec::H264 => EncoderVariant::Omx264,
            Codec::H265 => EncoderVariant::Omx265,
        }
    }

    pub fn element_factory_name(self) -> &'static str {
        match self {
            EncoderVariant::X264 => "x264enc",
            EncoderVariant::X265 => "x265enc",
            EncoderVariant::Vaapi264 => "vaapih264enc",
            EncoderVariant::Vaapi265 => "vaapih265enc",
            EncoderVariant::Omx264 => "omxh264enc",
            EncoderVariant::Omx265 => "omxh265enc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BitrateControl {
    Cbr,
    Vbr,
    Cqp,
}

impl BitrateControl {
    pub fn from_wire(v: u32) -> Option<BitrateControl> {
        match v {
            0 => Some(BitrateControl::Cbr),
            1 => Some(BitrateControl::Vbr),
            2 => Some(BitrateControl::Cqp),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SrtMode {
    Caller,
    Listener,
    Rendezvous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    Srt,
    Recording,
    ImageCapture,
}

impl TargetKind {
    /// Kebab-case spelling for the worker binaries' `value_enum` arguments.
    pub fn cli_str(self) -> &'static str {
        match self {
            TargetKind::Srt => "srt",
            TargetKind::Recording => "recording",
            TargetKind::ImageCapture => "image-capture",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdaptorKind {
    Null,
    Bandwidth,
}

impl Default for AdaptorKind {
    fn default() -> Self {
        AdaptorKind::Null
    }
}

impl AdaptorKind {
    pub fn from_wire(v: u32) -> Option<AdaptorKind> {
        match v {
            0 => Some(AdaptorKind::Null),
            1 => Some(AdaptorKind::Bandwidth),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

/// Resolved Open Question: free-form width/height rather than a fixed enum,
/// matching the way camera resolution is already configured elsewhere in
/// this codebase. The four legacy presets are kept as constructors for
/// convenience and for parity with the original's named resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const SD: Resolution = Resolution { width: 720, height: 480 };
    pub const HD: Resolution = Resolution { width: 1280, height: 720 };
    pub const FULL_HD: Resolution = Resolution { width: 1920, height: 1080 };
    pub const UHD: Resolution = Resolution { width: 3840, height: 2160 };
}

/// A bundle of parameters the adaptor may propose a change to. Any subset
/// may be `None`; `None` means "leave this property alone".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EncodingParameters {
    pub bitrate: Option<u32>,
    pub quantizer: Option<u32>,
    pub rate_control: Option<BitrateControl>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_variant_resolution() {
        assert_eq!(
            EncoderVariant::resolve(Codec::H264, EncodingFamily::General),
            EncoderVariant::X264
        );
        assert_eq!(
            EncoderVariant::resolve(Codec::H265, EncodingFamily::HwAccelerated),
            EncoderVariant::Vaapi265
        );
    }

    #[test]
    fn codec_wire_roundtrip() {
        assert_eq!(Codec::from_wire(1), Some(Codec::H264));
        assert_eq!(Codec::from_wire(2), Some(Codec::H265));
        assert_eq!(Codec::from_wire(0), None);
        assert_eq!(Codec::H264.to_wire(), 1);
    }
}
