//! Flax msgpack checkpoints (`flax_model.msgpack`)
//!
//! The file is a nested msgpack map from parameter names to arrays. An array
//! is ext type 1 (numpy scalars use ext type 3) whose payload is another
//! msgpack value: `[shape, dtype name, raw little-endian bytes]`. Arrays over
//! 1 GiB are written as a `__msgpack_chunked_array__` map of flat chunks.
//!
//! Loading flattens the tree into Candle names and layouts:
//! `kernel` becomes `weight` (dense `[in, out]` to `[out, in]`, conv `HWIO`
//! to `OIHW`), while `scale` and `embedding` become `weight` unchanged.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rmpv::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

const EXT_NDARRAY: i8 = 1;
const EXT_NPSCALAR: i8 = 3;
const CHUNKED_ARRAY_KEY: &str = "__msgpack_chunked_array__";

/// True when `path` names a Flax msgpack checkpoint rather than safetensors
pub fn is_flax_checkpoint(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "msgpack")
}

/// Read a Flax checkpoint into a `VarBuilder`.
///
/// `rename` receives each converted name (`model.shared.weight`) and returns
/// the name the model loads it under, or `None` to skip the tensor.
pub fn load_var_builder<F>(path: &Path, rename: F, dtype: DType, device: &Device) -> Result<VarBuilder<'static>>
where
    F: Fn(&str) -> Option<String>,
{
    info!(path = %path.display(), "Reading Flax checkpoint");
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let tree = rmpv::decode::read_value(&mut bytes.as_slice())
        .with_context(|| format!("Failed to decode msgpack: {}", path.display()))?;
    drop(bytes);

    let mut leaves = Vec::new();
    flatten(tree, String::new(), &mut leaves)?;

    let mut tensors = HashMap::with_capacity(leaves.len());
    for (flax_name, leaf) in leaves {
        let Some(name) = rename(&candle_name(&flax_name)) else {
            continue;
        };
        let tensor = decode_leaf(&leaf, device)
            .with_context(|| format!("Failed to decode parameter {flax_name}"))?;
        let tensor = to_candle_layout(&flax_name, tensor)?.to_dtype(dtype)?;
        debug!(name = %name, shape = ?tensor.dims(), "Loaded Flax parameter");
        tensors.insert(name, tensor);
    }

    info!(tensors = tensors.len(), "✓ Flax checkpoint converted");
    Ok(VarBuilder::from_tensors(tensors, dtype, device))
}

fn is_chunked_array(entries: &[(Value, Value)]) -> bool {
    entries
        .iter()
        .any(|(k, v)| k.as_str() == Some(CHUNKED_ARRAY_KEY) && v.as_bool() == Some(true))
}

/// Collect `(a/b/c, array)` pairs from the nested map
fn flatten(value: Value, prefix: String, out: &mut Vec<(String, Value)>) -> Result<()> {
    match value {
        Value::Map(entries) if !is_chunked_array(&entries) => {
            for (key, child) in entries {
                let key = key
                    .as_str()
                    .with_context(|| format!("Non-string key under '{prefix}'"))?
                    .to_string();
                let path = if prefix.is_empty() { key } else { format!("{prefix}/{key}") };
                flatten(child, path, out)?;
            }
            Ok(())
        }
        leaf => {
            out.push((prefix, leaf));
            Ok(())
        }
    }
}

/// `model/shared/embedding` -> `model.shared.weight`
fn candle_name(flax_name: &str) -> String {
    let (parent, leaf) = flax_name.rsplit_once('/').unwrap_or(("", flax_name));
    let leaf = match leaf {
        "kernel" | "scale" | "embedding" => "weight",
        other => other,
    };
    if parent.is_empty() {
        leaf.to_string()
    } else {
        format!("{}.{}", parent.replace('/', "."), leaf)
    }
}

fn to_candle_layout(flax_name: &str, tensor: Tensor) -> Result<Tensor> {
    if !flax_name.ends_with("kernel") {
        return Ok(tensor);
    }
    let tensor = match tensor.rank() {
        2 => tensor.t()?,
        4 => tensor.permute((3, 2, 0, 1))?,
        _ => tensor,
    };
    Ok(tensor.contiguous()?)
}

fn flax_dtype(name: &str) -> Result<DType> {
    match name {
        "float32" => Ok(DType::F32),
        "float16" => Ok(DType::F16),
        "bfloat16" => Ok(DType::BF16),
        "float64" => Ok(DType::F64),
        "uint8" => Ok(DType::U8),
        "uint32" => Ok(DType::U32),
        "int64" => Ok(DType::I64),
        other => anyhow::bail!("Unsupported array dtype '{other}'"),
    }
}

fn decode_leaf(leaf: &Value, device: &Device) -> Result<Tensor> {
    match leaf {
        Value::Ext(EXT_NDARRAY | EXT_NPSCALAR, payload) => decode_ndarray(payload, device),
        Value::Map(entries) => decode_chunked(entries, device),
        other => anyhow::bail!("Expected an array, found {other}"),
    }
}

fn decode_ndarray(payload: &[u8], device: &Device) -> Result<Tensor> {
    let value = rmpv::decode::read_value(&mut &payload[..]).context("Malformed array payload")?;
    let [shape, dtype, data] = value.as_array().map(Vec::as_slice).unwrap_or_default() else {
        anyhow::bail!("Array payload is not [shape, dtype, data]");
    };

    let shape = shape
        .as_array()
        .context("Array shape is not a list")?
        .iter()
        .map(|dim| dim.as_u64().map(|d| d as usize))
        .collect::<Option<Vec<_>>>()
        .context("Array shape has a non-integer dimension")?;
    let dtype = flax_dtype(dtype.as_str().context("Array dtype is not a string")?)?;
    let data = data.as_slice().context("Array data is not binary")?;

    Ok(Tensor::from_raw_buffer(data, dtype, &shape, device)?)
}

/// Indexed map `{"0": a, "1": b}` as a list ordered by index
fn indexed_entries(value: &Value) -> Result<Vec<&Value>> {
    let mut entries = value
        .as_map()
        .context("Expected an indexed map")?
        .iter()
        .map(|(k, v)| {
            let index = k
                .as_str()
                .and_then(|k| k.parse::<usize>().ok())
                .context("Indexed map key is not a number")?;
            Ok((index, v))
        })
        .collect::<Result<Vec<_>>>()?;
    entries.sort_by_key(|(index, _)| *index);
    Ok(entries.into_iter().map(|(_, v)| v).collect())
}

fn decode_chunked(entries: &[(Value, Value)], device: &Device) -> Result<Tensor> {
    let field = |name: &str| {
        entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(name))
            .map(|(_, v)| v)
            .with_context(|| format!("Chunked array has no '{name}'"))
    };

    let shape = indexed_entries(field("shape")?)?
        .into_iter()
        .map(|dim| dim.as_u64().map(|d| d as usize))
        .collect::<Option<Vec<_>>>()
        .context("Chunked array shape has a non-integer dimension")?;
    let chunks = indexed_entries(field("chunks")?)?
        .into_iter()
        .map(|chunk| decode_leaf(chunk, device)?.flatten_all().map_err(anyhow::Error::from))
        .collect::<Result<Vec<_>>>()?;

    Ok(Tensor::cat(&chunks, 0)?.reshape(shape)?)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Write Flax-style checkpoints from Candle tensors

    use super::*;

    /// Ext value holding `tensor` as a float32 ndarray in `shape` order
    pub(crate) fn ndarray(tensor: &Tensor) -> Value {
        let data: Vec<u8> = tensor
            .to_dtype(DType::F32)
            .unwrap()
            .contiguous()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let shape = tensor.dims().iter().map(|&d| Value::from(d as u64)).collect();
        let payload = Value::Array(vec![Value::Array(shape), Value::from("float32"), Value::Binary(data)]);
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &payload).unwrap();
        Value::Ext(EXT_NDARRAY, bytes)
    }

    /// Every variable of `varmap` in Flax naming and layout.
    ///
    /// `flax_path` turns the Candle module path (`model.encoder.layers.0.fc1`)
    /// into the Flax one (`model/encoder/layers/0/fc1`).
    pub(crate) fn varmap_leaves<F>(varmap: &candle_nn::VarMap, flax_path: F) -> Vec<(String, Value)>
    where
        F: Fn(&str) -> String,
    {
        let data = varmap.data().lock().unwrap();
        let mut leaves: Vec<(String, Value)> = data
            .iter()
            .map(|(name, var)| {
                let tensor = var.as_tensor();
                let (parent, leaf) = name.rsplit_once('.').unwrap_or(("", name.as_str()));
                let is_embedding = parent.ends_with("shared") || parent.contains("embed");
                let (leaf, tensor) = match (leaf, tensor.rank()) {
                    ("weight", 1) => ("scale", tensor.clone()),
                    ("weight", 2) if is_embedding => ("embedding", tensor.clone()),
                    ("weight", 2) => ("kernel", tensor.t().unwrap()),
                    ("weight", 4) => ("kernel", tensor.permute((2, 3, 1, 0)).unwrap()),
                    (other, _) => (other, tensor.clone()),
                };
                let path = if parent.is_empty() {
                    leaf.to_string()
                } else {
                    format!("{}/{}", flax_path(parent), leaf)
                };
                (path, ndarray(&tensor))
            })
            .collect();
        leaves.sort_by(|a, b| a.0.cmp(&b.0));
        leaves
    }

    /// Nest `a/b/c` paths into msgpack maps and write them to `path`
    pub(crate) fn write_checkpoint(path: &Path, leaves: Vec<(String, Value)>) {
        fn insert(map: &mut Vec<(Value, Value)>, segments: &[&str], leaf: Value) {
            let (head, rest) = segments.split_first().unwrap();
            if rest.is_empty() {
                map.push((Value::from(*head), leaf));
                return;
            }
            let position = map.iter().position(|(k, _)| k.as_str() == Some(*head));
            let index = position.unwrap_or_else(|| {
                map.push((Value::from(*head), Value::Map(Vec::new())));
                map.len() - 1
            });
            match &mut map[index].1 {
                Value::Map(child) => insert(child, rest, leaf),
                _ => panic!("{head} is both a leaf and a map"),
            }
        }

        let mut root = Vec::new();
        for (name, leaf) in leaves {
            let segments: Vec<&str> = name.split('/').collect();
            insert(&mut root, &segments, leaf);
        }
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &Value::Map(root)).unwrap();
        std::fs::write(path, bytes).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ndarray, write_checkpoint};
    use super::*;
    use tempfile::TempDir;

    fn keep_all(name: &str) -> Option<String> {
        Some(name.to_string())
    }

    #[test]
    fn test_candle_names() {
        assert_eq!(candle_name("model/shared/embedding"), "model.shared.weight");
        assert_eq!(candle_name("lm_head/kernel"), "lm_head.weight");
        assert_eq!(candle_name("model/encoder/layers/0/fc1/bias"), "model.encoder.layers.0.fc1.bias");
        assert_eq!(candle_name("decoder/norm_out/scale"), "decoder.norm_out.weight");
        assert_eq!(candle_name("final_logits_bias"), "final_logits_bias");
    }

    #[test]
    fn test_is_flax_checkpoint() {
        assert!(is_flax_checkpoint(Path::new("/cache/flax_model.msgpack")));
        assert!(!is_flax_checkpoint(Path::new("/cache/model.safetensors")));
    }

    #[test]
    fn test_load_converts_layouts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flax_model.msgpack");
        let device = Device::Cpu;

        // Dense kernel [in=2, out=3], conv kernel HWIO [1, 1, 2, 3]
        let dense = Tensor::arange(0f32, 6., &device).unwrap().reshape((2, 3)).unwrap();
        let conv = Tensor::arange(0f32, 6., &device).unwrap().reshape((1, 1, 2, 3)).unwrap();
        let scale = Tensor::new(&[1f32, 2.], &device).unwrap();
        write_checkpoint(
            &path,
            vec![
                ("proj/kernel".to_string(), ndarray(&dense)),
                ("proj/bias".to_string(), ndarray(&Tensor::zeros(3, DType::F32, &device).unwrap())),
                ("conv/kernel".to_string(), ndarray(&conv)),
                ("norm/scale".to_string(), ndarray(&scale)),
            ],
        );

        let vb = load_var_builder(&path, keep_all, DType::F32, &device).unwrap();

        let weight = vb.get((3, 2), "proj.weight").unwrap();
        assert_eq!(weight.to_vec2::<f32>().unwrap(), vec![vec![0., 3.], vec![1., 4.], vec![2., 5.]]);

        let conv_weight = vb.get((3, 2, 1, 1), "conv.weight").unwrap();
        let expected = dense.t().unwrap().reshape((3, 2, 1, 1)).unwrap();
        let diff = (conv_weight - expected).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);

        let norm = vb.get(2, "norm.weight").unwrap();
        assert_eq!(norm.to_vec1::<f32>().unwrap(), vec![1., 2.]);
        assert!(vb.contains_tensor("proj.bias"));
    }

    #[test]
    fn test_rename_can_skip_tensors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flax_model.msgpack");
        let device = Device::Cpu;
        let ones = Tensor::ones(2, DType::F32, &device).unwrap();
        write_checkpoint(
            &path,
            vec![
                ("encoder/conv/bias".to_string(), ndarray(&ones)),
                ("decoder/conv/bias".to_string(), ndarray(&ones)),
            ],
        );

        let vb = load_var_builder(
            &path,
            |name| (!name.starts_with("encoder.")).then(|| name.replace("decoder.", "dec.")),
            DType::F32,
            &device,
        )
        .unwrap();
        assert!(vb.contains_tensor("dec.conv.bias"));
        assert!(!vb.contains_tensor("encoder.conv.bias"));
    }

    #[test]
    fn test_chunked_array_is_reassembled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flax_model.msgpack");
        let device = Device::Cpu;

        let first = Tensor::new(&[0f32, 1., 2., 3.], &device).unwrap();
        let second = Tensor::new(&[4f32, 5.], &device).unwrap();
        let chunked = Value::Map(vec![
            (Value::from(CHUNKED_ARRAY_KEY), Value::from(true)),
            (
                Value::from("shape"),
                Value::Map(vec![(Value::from("0"), Value::from(3u64)), (Value::from("1"), Value::from(2u64))]),
            ),
            (
                Value::from("chunks"),
                Value::Map(vec![(Value::from("1"), ndarray(&second)), (Value::from("0"), ndarray(&first))]),
            ),
        ]);
        write_checkpoint(&path, vec![("table/embedding".to_string(), chunked)]);

        let vb = load_var_builder(&path, keep_all, DType::F32, &device).unwrap();
        let table = vb.get((3, 2), "table.weight").unwrap();
        assert_eq!(table.to_vec2::<f32>().unwrap(), vec![vec![0., 1.], vec![2., 3.], vec![4., 5.]]);
    }

    #[test]
    fn test_unsupported_dtype_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flax_model.msgpack");

        let payload = Value::Array(vec![
            Value::Array(vec![Value::from(1u64)]),
            Value::from("complex64"),
            Value::Binary(vec![0; 8]),
        ]);
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &payload).unwrap();
        write_checkpoint(&path, vec![("x/bias".to_string(), Value::Ext(EXT_NDARRAY, bytes))]);

        let err = load_var_builder(&path, keep_all, DType::F32, &Device::Cpu).err().unwrap();
        assert!(format!("{err:#}").contains("complex64"));
    }
}
