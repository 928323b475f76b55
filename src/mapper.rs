//! Encoder parameter mapper: translates abstract bitrate/quantizer/rate-control
//! intents into the GObject property writes the concrete encoder element
//! expects, and decides when a property write requires cycling the encoder
//! through `Ready` first.
//!
//! x264enc and the VAAPI/OMX encoders accept their properties live; x265enc's
//! rate-control is baked into `option-string` at construction time and
//! changing it afterwards needs to go through `Ready` like the others, so in
//! practice every non-bitrate change on this table ends up needing the cycle
//! except for x264's bitrate and quantizer.

use gstreamer::prelude::*;
use gstreamer::Element;
use tracing::warn;

use crate::types::{BitrateControl, EncoderVariant, EncodingParameters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bitrate,
    Quantizer,
    RateControl,
}

/// Whether writing `kind` on `variant` requires the caller to transition the
/// encoder to `Ready`, apply the write, then restore its prior state.
pub fn requires_ready_cycle(variant: EncoderVariant, kind: ParamKind) -> bool {
    use EncoderVariant::*;
    use ParamKind::*;
    match (variant, kind) {
        (Vaapi264, _) | (Vaapi265, _) => true,
        (X265, RateControl) => true,
        (X264, Quantizer) | (X264, RateControl) => true,
        _ => false,
    }
}

fn ratectrl_to_x264_pass(c: BitrateControl) -> i32 {
    match c {
        BitrateControl::Cbr => 0,
        BitrateControl::Cqp => 4,
        BitrateControl::Vbr => 17,
    }
}

fn x264_pass_to_ratectrl(pass: i32) -> Option<BitrateControl> {
    match pass {
        0 => Some(BitrateControl::Cbr),
        4 => Some(BitrateControl::Cqp),
        17 => Some(BitrateControl::Vbr),
        _ => None,
    }
}

fn ratectrl_to_vaapi(c: BitrateControl) -> i32 {
    match c {
        BitrateControl::Cqp => 1,
        BitrateControl::Cbr => 2,
        BitrateControl::Vbr => 4,
    }
}

fn vaapi_to_ratectrl(v: i32) -> Option<BitrateControl> {
    match v {
        1 => Some(BitrateControl::Cqp),
        2 => Some(BitrateControl::Cbr),
        4 => Some(BitrateControl::Vbr),
        _ => None,
    }
}

fn ratectrl_to_omx(c: BitrateControl) -> Option<i32> {
    match c {
        BitrateControl::Cbr => Some(2),
        BitrateControl::Vbr => Some(1),
        BitrateControl::Cqp => None,
    }
}

fn omx_to_ratectrl(v: i32) -> Option<BitrateControl> {
    match v {
        2 => Some(BitrateControl::Cbr),
        1 => Some(BitrateControl::Vbr),
        _ => None,
    }
}

/// Whether `variant`'s `bitrate` property is expressed in kbps, so a bps
/// value set on it loses precision down to the nearest 1000. x264/x265/VAAPI
/// all divide by 1000 before writing; the OMX variants take raw bps and so
/// report back exactly what was set.
pub fn bitrate_quantizes_to_kbps(variant: EncoderVariant) -> bool {
    use EncoderVariant::*;
    !matches!(variant, Omx264 | Omx265)
}

/// The keyframe-interval property name for `variant`, or `None` for the OMX
/// encoders, which expose no such property (the original's own OMX pipeline
/// template never sets one either).
pub fn idr_period_property_name(variant: EncoderVariant) -> Option<&'static str> {
    use EncoderVariant::*;
    match variant {
        X264 | X265 | Vaapi264 | Vaapi265 => Some("key-int-max"),
        Omx264 | Omx265 => None,
    }
}

/// Writes the construction-time keyframe interval onto `encoder`, ignored on
/// variants with no such property. Unlike bitrate/quantizer/rate-control this
/// is set once and is not part of `EncodingParameters` — there is no runtime
/// control message that changes it after the target is built.
pub fn apply_idr_period(encoder: &Element, variant: EncoderVariant, idr_period: u32) {
    match idr_period_property_name(variant) {
        Some(name) => encoder.set_property(name, idr_period),
        None => warn!(?variant, "encoder has no keyframe-interval property, ignoring idr_period"),
    }
}

/// Applies a subset of `params` directly via `set_property`, with no
/// Ready-cycling. Callers that need the cycle (see `requires_ready_cycle`)
/// must bracket this with a state transition themselves — this function
/// only knows how to map values onto properties, not when it is safe to do
/// so while the pipeline is flowing.
pub fn apply(encoder: &Element, variant: EncoderVariant, params: &EncodingParameters) {
    use EncoderVariant::*;

    if let Some(bitrate) = params.bitrate {
        match variant {
            X264 | X265 | Vaapi264 | Vaapi265 => {
                encoder.set_property("bitrate", (bitrate / 1000).max(1));
            }
            Omx264 | Omx265 => {
                encoder.set_property("bitrate", bitrate);
            }
        }
    }

    if let Some(q) = params.quantizer {
        match variant {
            X264 => encoder.set_property("quantizer", q),
            X265 => encoder.set_property("qp", q as i32),
            Vaapi264 | Vaapi265 => encoder.set_property("init-qp", q as i32),
            Omx264 | Omx265 => warn!("omx encoders have no quantizer property, ignoring"),
        }
    }

    if let Some(control) = params.rate_control {
        match variant {
            X264 => encoder.set_property("pass", ratectrl_to_x264_pass(control)),
            X265 => apply_x265_ratectrl(encoder, control, params.quantizer),
            Vaapi264 | Vaapi265 => encoder.set_property("rate-control", ratectrl_to_vaapi(control)),
            Omx264 | Omx265 => {
                if let Some(v) = ratectrl_to_omx(control) {
                    encoder.set_property("control-rate", v);
                } else {
                    warn!("omx encoders do not support CQP, ignoring rate-control change");
                }
            }
        }
    }
}

fn apply_x265_ratectrl(encoder: &Element, control: BitrateControl, quantizer: Option<u32>) {
    match control {
        BitrateControl::Cqp => {
            let qp = quantizer.unwrap_or(0) as i32;
            encoder.set_property("option-string", "");
            encoder.set_property("qp", qp);
        }
        BitrateControl::Vbr => {
            encoder.set_property("option-string", "");
            encoder.set_property("qp", -1i32);
        }
        BitrateControl::Cbr => {
            let bitrate: u32 = encoder.property("bitrate");
            let option_string = format!("strict-cbr=1:vbv-bufsize={bitrate}");
            encoder.set_property("option-string", option_string);
            encoder.set_property("qp", -1i32);
        }
    }
}

/// Reads the encoder's *actual* current setting back, the inverse of
/// `apply`. x265's rate-control must be reconstructed from both `qp` and
/// `option-string` since the element exposes no single enum property for it.
pub fn read_actual(encoder: &Element, variant: EncoderVariant, kind: ParamKind) -> Option<i64> {
    use EncoderVariant::*;
    match (variant, kind) {
        (X264, ParamKind::Bitrate)
        | (X265, ParamKind::Bitrate)
        | (Vaapi264, ParamKind::Bitrate)
        | (Vaapi265, ParamKind::Bitrate) => {
            let kbps: u32 = encoder.property("bitrate");
            Some(kbps as i64 * 1000)
        }
        (Omx264, ParamKind::Bitrate) | (Omx265, ParamKind::Bitrate) => {
            let bps: u32 = encoder.property("bitrate");
            Some(bps as i64)
        }
        (X264, ParamKind::Quantizer) => Some(encoder.property::<i32>("quantizer") as i64),
        (X265, ParamKind::Quantizer) => Some(encoder.property::<i32>("qp") as i64),
        (Vaapi264, ParamKind::Quantizer) | (Vaapi265, ParamKind::Quantizer) => {
            Some(encoder.property::<i32>("init-qp") as i64)
        }
        (Omx264, ParamKind::Quantizer) | (Omx265, ParamKind::Quantizer) => None,
        (X264, ParamKind::RateControl) => {
            x264_pass_to_ratectrl(encoder.property::<i32>("pass")).map(|c| c as i64)
        }
        (X265, ParamKind::RateControl) => {
            let option_string: String = encoder.property("option-string");
            let control = if option_string.contains("strict-cbr=1") {
                BitrateControl::Cbr
            } else {
                let qp: i32 = encoder.property("qp");
                if qp >= 0 {
                    BitrateControl::Cqp
                } else {
                    BitrateControl::Vbr
                }
            };
            Some(control as i64)
        }
        (Vaapi264, ParamKind::RateControl) | (Vaapi265, ParamKind::RateControl) => {
            vaapi_to_ratectrl(encoder.property::<i32>("rate-control")).map(|c| c as i64)
        }
        (Omx264, ParamKind::RateControl) | (Omx265, ParamKind::RateControl) => {
            omx_to_ratectrl(encoder.property::<i32>("control-rate")).map(|c| c as i64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn x264_pass_roundtrip() {
        for c in [BitrateControl::Cbr, BitrateControl::Cqp, BitrateControl::Vbr] {
            let pass = ratectrl_to_x264_pass(c);
            assert_eq!(x264_pass_to_ratectrl(pass), Some(c));
        }
    }

    #[test]
    fn vaapi_ratectrl_roundtrip() {
        for c in [BitrateControl::Cbr, BitrateControl::Cqp, BitrateControl::Vbr] {
            let v = ratectrl_to_vaapi(c);
            assert_eq!(vaapi_to_ratectrl(v), Some(c));
        }
    }

    #[test]
    fn omx_has_no_cqp() {
        assert_eq!(ratectrl_to_omx(BitrateControl::Cqp), None);
    }

    #[test]
    fn omx_has_no_idr_period_property() {
        assert_eq!(idr_period_property_name(EncoderVariant::Omx264), None);
        assert_eq!(idr_period_property_name(EncoderVariant::X264), Some("key-int-max"));
    }

    #[rstest]
    #[case(EncoderVariant::Vaapi264, ParamKind::Bitrate, true)]
    #[case(EncoderVariant::Vaapi265, ParamKind::Quantizer, true)]
    #[case(EncoderVariant::X265, ParamKind::RateControl, true)]
    #[case(EncoderVariant::X264, ParamKind::Quantizer, true)]
    #[case(EncoderVariant::X264, ParamKind::Bitrate, false)]
    #[case(EncoderVariant::X265, ParamKind::Bitrate, false)]
    #[case(EncoderVariant::Omx264, ParamKind::Bitrate, false)]
    #[case(EncoderVariant::Omx265, ParamKind::RateControl, false)]
    fn ready_cycle_matrix(#[case] variant: EncoderVariant, #[case] kind: ParamKind, #[case] expected: bool) {
        assert_eq!(requires_ready_cycle(variant, kind), expected);
    }
}
