mod checkpoint;
pub use checkpoint::CheckpointError;

mod decoder;
pub use decoder::{DecoderLayer, TransformerDecoder, TransformerDecoderError};

mod encoder;
pub use encoder::{EncoderLayer, TransformerEncoder, TransformerEncoderError};

mod model;
pub use model::{TransformerModel, TransformerModelError};

mod output;
pub use output::{OutputLayer, OutputLayerError};
