use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use half::f16;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::config::ModelConfig;

use super::model::{TransformerModel, TransformerModelError};

/// Errors for model serialization.
#[derive(Debug, Snafu)]
pub enum CheckpointError {
    #[snafu(display("Cannot construct the model"))]
    Build { source: TransformerModelError },

    #[snafu(display("Cannot convert parameter {name}"))]
    Convert {
        name: String,
        source: candle_core::Error,
    },

    #[snafu(display("Header field {value} is not a valid size"))]
    Header { value: i32 },

    #[snafu(display("Cannot open {}", path.display()))]
    Open { path: PathBuf, source: io::Error },

    #[snafu(display("Cannot read model data"))]
    Read { source: io::Error },

    #[snafu(display("Cannot update parameter {name}"))]
    Update {
        name: String,
        source: candle_core::Error,
    },

    #[snafu(display("Cannot write model data"))]
    Write { source: io::Error },
}

/// Raw parameter file support.
///
/// A model file is a fixed header of 12 little-endian 32-bit integers
/// (encoder layers, decoder layers, FFN hidden size, model size, embedding
/// size, source and target vocabulary sizes, head count, maximum relative
/// distance, both embedding-sharing flags, maximum position) followed by
/// the raw elements of every parameter in [`TransformerModel::params`]
/// order, `f32` or IEEE `f16` depending on the precision switch. Switches
/// not covered by the header (normalization placement, relative-position
/// attention, history, dropout rates) come from the configuration passed
/// at load time.
impl TransformerModel {
    /// Write the model to a parameter file.
    pub fn dump<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
        let file = File::create(path.as_ref()).context(OpenSnafu {
            path: path.as_ref(),
        })?;
        let mut writer = BufWriter::new(file);
        self.dump_to(&mut writer)?;
        writer.flush().context(WriteSnafu)
    }

    /// Write the model to a writer.
    pub fn dump_to<W: Write>(&self, writer: &mut W) -> Result<(), CheckpointError> {
        let start = Instant::now();
        self.write_header(writer)?;

        for (name, tensor) in self.params() {
            let flat = tensor.flatten_all().context(ConvertSnafu {
                name: name.as_str(),
            })?;
            let bytes = match flat.dtype() {
                DType::F16 => {
                    let values = flat.to_vec1::<f16>().context(ConvertSnafu {
                        name: name.as_str(),
                    })?;
                    let mut bytes = Vec::with_capacity(values.len() * 2);
                    for value in values {
                        bytes.extend_from_slice(&value.to_le_bytes());
                    }
                    bytes
                }
                _ => {
                    let values = flat
                        .to_dtype(DType::F32)
                        .and_then(|flat| flat.to_vec1::<f32>())
                        .context(ConvertSnafu {
                            name: name.as_str(),
                        })?;
                    let mut bytes = Vec::with_capacity(values.len() * 4);
                    for value in values {
                        bytes.extend_from_slice(&value.to_le_bytes());
                    }
                    bytes
                }
            };
            writer.write_all(&bytes).context(WriteSnafu)?;
        }

        tracing::info!("Model saved (took {:.1}s)", start.elapsed().as_secs_f32());
        Ok(())
    }

    /// Load a model from a parameter file.
    ///
    /// * `path` - Parameter file.
    /// * `config` - Base configuration supplying the switches the file
    ///   header does not carry.
    /// * `device` - Device to place the parameters on.
    ///
    /// Returns the model and the variable store holding its parameters.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        config: ModelConfig,
        device: &Device,
    ) -> Result<(Self, VarMap), CheckpointError> {
        let file = File::open(path.as_ref()).context(OpenSnafu {
            path: path.as_ref(),
        })?;
        let mut reader = BufReader::new(file);
        Self::from_reader(&mut reader, config, device)
    }

    /// Load a model from a reader.
    pub fn from_reader<R: Read>(
        reader: &mut R,
        config: ModelConfig,
        device: &Device,
    ) -> Result<(Self, VarMap), CheckpointError> {
        let start = Instant::now();
        let config = read_header(reader, config)?;

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype(), device);
        let model = TransformerModel::new(config, vb).context(BuildSnafu)?;

        for (name, tensor) in model.params() {
            let n_elements = tensor.elem_count();
            let value = match tensor.dtype() {
                DType::F16 => {
                    let mut values = Vec::with_capacity(n_elements);
                    let mut buffer = [0u8; 2];
                    for _ in 0..n_elements {
                        reader.read_exact(&mut buffer).context(ReadSnafu)?;
                        values.push(f16::from_le_bytes(buffer));
                    }
                    Tensor::from_vec(values, tensor.dims(), device)
                }
                _ => {
                    let mut values = Vec::with_capacity(n_elements);
                    let mut buffer = [0u8; 4];
                    for _ in 0..n_elements {
                        reader.read_exact(&mut buffer).context(ReadSnafu)?;
                        values.push(f32::from_le_bytes(buffer));
                    }
                    Tensor::from_vec(values, tensor.dims(), device)
                }
            }
            .context(ConvertSnafu {
                name: name.as_str(),
            })?;
            varmap.set_one(&name, value).context(UpdateSnafu {
                name: name.as_str(),
            })?;
        }

        tracing::info!("Model loaded (took {:.1}s)", start.elapsed().as_secs_f32());
        Ok((model, varmap))
    }

    fn write_header<W: Write>(&self, writer: &mut W) -> Result<(), CheckpointError> {
        let config = self.config();
        let header = [
            config.n_encoder_layers as i32,
            config.n_decoder_layers as i32,
            config.ffn_hidden_size as i32,
            config.model_size as i32,
            config.emb_size as i32,
            config.src_vocab_size as i32,
            config.tgt_vocab_size as i32,
            config.n_heads as i32,
            config.max_relative_position as i32,
            config.shared_embeddings as i32,
            config.shared_output_embeddings as i32,
            config.max_position as i32,
        ];
        for value in header {
            writer.write_all(&value.to_le_bytes()).context(WriteSnafu)?;
        }
        Ok(())
    }
}

fn read_header<R: Read>(
    reader: &mut R,
    config: ModelConfig,
) -> Result<ModelConfig, CheckpointError> {
    let mut fields = [0i32; 12];
    let mut buffer = [0u8; 4];
    for field in &mut fields {
        reader.read_exact(&mut buffer).context(ReadSnafu)?;
        *field = i32::from_le_bytes(buffer);
    }
    let [n_encoder_layers, n_decoder_layers, ffn_hidden_size, model_size, emb_size, src_vocab_size, tgt_vocab_size, n_heads, max_relative_position, shared_embeddings, shared_output_embeddings, max_position] =
        fields;

    Ok(config
        .n_encoder_layers(header_size(n_encoder_layers)?)
        .n_decoder_layers(header_size(n_decoder_layers)?)
        .ffn_hidden_size(header_size(ffn_hidden_size)?)
        .model_size(header_size(model_size)?)
        .emb_size(header_size(emb_size)?)
        .src_vocab_size(header_size(src_vocab_size)?)
        .tgt_vocab_size(header_size(tgt_vocab_size)?)
        .n_heads(header_size(n_heads)?)
        .max_relative_position(header_size(max_relative_position)?)
        .shared_embeddings(shared_embeddings != 0)
        .shared_output_embeddings(shared_output_embeddings != 0)
        .max_position(header_size(max_position)?))
}

fn header_size(value: i32) -> Result<usize, CheckpointError> {
    usize::try_from(value).ok().context(HeaderSnafu { value })
}
