//! Interleaved to channel-planar conversion.
//!
//! Colour cameras deliver pixels interleaved in vendor component order
//! (B, G, R for `Rgb24`, B, G, R, A for `Rgb32`). Downstream consumers expect
//! one plane per channel. Still-capture consumers want R, G, B plane order, the
//! streaming path keeps the vendor order.

use serde::{Deserialize, Serialize};

/// Destination of a delivered frame; decides the colour plane order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameConsumer {
    /// Single frames handed to the completion callback. Planes are R, G, B.
    #[default]
    Still,
    /// Video/preview frames. Planes stay in vendor order.
    Streaming,
}

impl FrameConsumer {
    /// Whether the first and last colour planes must be exchanged.
    pub fn swaps_first_last(&self) -> bool {
        matches!(self, FrameConsumer::Still)
    }
}

/// Copy interleaved `src` into `dst` as `channels` consecutive planes.
///
/// `src` and `dst` must have the same length, a multiple of `channels`. With
/// `swap_first_last` the first and third planes (the colour channels that
/// differ between B, G, R and R, G, B) are exchanged during the same pass.
/// A fourth channel (alpha) always stays last.
pub fn deinterleave_into_planes(
    src: &[u8],
    dst: &mut [u8],
    channels: usize,
    swap_first_last: bool,
) {
    debug_assert_eq!(src.len(), dst.len());
    if channels <= 1 {
        dst.copy_from_slice(src);
        return;
    }
    debug_assert_eq!(src.len() % channels, 0);

    let plane = src.len() / channels;
    for c in 0..channels {
        let target = match c {
            0 if swap_first_last && channels >= 3 => 2,
            2 if swap_first_last => 0,
            _ => c,
        };
        let out = &mut dst[target * plane..(target + 1) * plane];
        for (o, px) in out.iter_mut().zip(src.chunks_exact(channels)) {
            *o = px[c];
        }
    }
}
