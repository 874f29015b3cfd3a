mod decoder;
mod encoder;
mod value;

pub use decoder::{decode, raw_dict_value};
pub use encoder::encode;
pub use value::BencodeValue;
