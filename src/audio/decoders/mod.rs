//! Built-in decoder factories.

mod generic;
mod wave;

pub use generic::{SymphoniaDecoder, SymphoniaDecoderFactory};
pub use wave::{WaveDecoder, WaveDecoderFactory};

use crate::audio::decoder::DecoderFactory;
use std::sync::Arc;

/// Built-in factories in priority order. Custom containers come before
/// the generic probe so their extra metadata (loop points) is kept.
pub fn builtin_factories() -> Vec<(&'static str, Arc<dyn DecoderFactory>)> {
    vec![
        ("_voicepool_int_wave", Arc::new(WaveDecoderFactory) as Arc<dyn DecoderFactory>),
        (
            "_voicepool_int_symphonia",
            Arc::new(SymphoniaDecoderFactory) as Arc<dyn DecoderFactory>,
        ),
    ]
}
