//! Bencode codec: the self-describing wire format used by metainfo files and
//! tracker responses. See [BEP 3](http://www.bittorrent.org/beps/bep_0003.html).

mod decoder;
mod encoder;
mod value;

pub use decoder::{decode, DecodeError, Decoder, MalformedBencode};
pub use encoder::encode;
pub use value::BValue;
