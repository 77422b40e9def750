use prost::{DecodeError, Message};
use rustc_hash::{FxHashMap, FxHashSet};
use std::{borrow::Cow, collections::hash_map::Entry, fs, io, path::Path};
use thiserror::Error;

use crate::{
    dim::{Dimension, Dimensions},
    fixed_dim::FixedDimensions,
    model::Model,
    node::Node,
    op::{Cast, Constant, Gelu, Op, QuickGelu, CONTRIB_DOMAIN},
    tensor::{Tensor, TensorElemType, TypedShape},
};

use super::proto::{
    tensor_proto::{DataLocation, DataType},
    tensor_shape_proto::dimension::Value::{DimParam, DimValue},
    type_proto::Value::TensorType,
    AttributeProto, ModelProto, TensorProto,
};

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("Model does not contain any graph")]
    NoGraph,

    #[error("Model is invalid: {0}")]
    InvalidModel(#[from] DecodeError),

    #[error("Model contains duplicated opsets")]
    DuplicateOpset,

    #[error("Model does not import the default opset")]
    NoOpset,

    #[error("Value type is not specified")]
    NoValueType,

    #[error("Value shape is not specified")]
    NoValueShape,

    #[error("Attribute '{0}' is not specified")]
    NoAttribute(&'static str),

    #[error("Unsupported op: {domain}::{op_type}")]
    UnsupportedOp { domain: String, op_type: String },

    #[error("Tensor '{0}' has inconsistent data")]
    InvalidTensor(String),

    #[error("Tensor '{0}' refers to external data but the model has no base directory")]
    NoExternalDataDir(String),

    #[error("Value '{0}' is produced more than once")]
    DuplicateValue(String),

    #[error("Graph contains a cycle")]
    Cycle,

    #[error("Something went wrong: {0}")]
    Todo(Cow<'static, str>),
}

/// Loads a model from `path`. External tensor data is resolved relative to the
/// directory containing `path`.
pub fn load_onnx(path: impl AsRef<Path>) -> Result<Model, ModelLoadError> {
    let path = path.as_ref();
    let model_proto = load_onnx_model_proto(path)?;
    load_onnx_from_model_proto(model_proto, Some(path.parent().unwrap_or(Path::new("."))))
}

pub fn load_onnx_from_buffer(buf: &[u8]) -> Result<Model, ModelLoadError> {
    let model = ModelProto::decode(buf)?;
    load_onnx_from_model_proto(model, None)
}

pub fn load_onnx_model_proto(path: impl AsRef<Path>) -> Result<ModelProto, ModelLoadError> {
    let model = ModelProto::decode(&*fs::read(path)?)?;
    Ok(model)
}

pub fn load_onnx_from_model_proto(
    model_proto: ModelProto,
    base_dir: Option<&Path>,
) -> Result<Model, ModelLoadError> {
    let graph = model_proto.graph.ok_or(ModelLoadError::NoGraph)?;
    let mut model = Model::default();
    let mut name_to_val = FxHashMap::default();

    let mut opset_version = None;
    for opset_import in &model_proto.opset_import {
        match opset_import.domain.as_str() {
            "" | "ai.onnx" if opset_version.is_none() => {
                opset_version = Some(opset_import.version)
            }
            "" | "ai.onnx" => return Err(ModelLoadError::DuplicateOpset),
            CONTRIB_DOMAIN => {}
            domain => {
                return Err(ModelLoadError::Todo(
                    format!("Custom domain ('{domain}') not supported yet").into(),
                ))
            }
        }
    }
    model.opset_version = opset_version.ok_or(ModelLoadError::NoOpset)?;

    // Load initializers.
    for init in graph.initializer.iter() {
        let tensor = get_tensor(init, base_dir)?;
        let val = *name_to_val
            .entry(init.name.as_str())
            .or_insert_with(|| model.graph.values.new_val_named(init.name.as_str()));
        model.graph.inits.insert(val, tensor);
    }

    // Load inputs and outputs.
    for (vals, vec) in [
        (&graph.input, &mut model.graph.inputs),
        (&graph.output, &mut model.graph.outputs),
    ] {
        for x in vals {
            let TensorType(tensor) = x
                .r#type
                .as_ref()
                .ok_or(ModelLoadError::NoValueType)?
                .value
                .as_ref()
                .ok_or(ModelLoadError::NoValueType)?;

            let dims = tensor
                .shape
                .as_ref()
                .ok_or(ModelLoadError::NoValueShape)?
                .dim
                .iter()
                .map(|d| match d.value.as_ref() {
                    Some(DimValue(i)) => Ok(Dimension::Fixed(*i as usize)),
                    Some(DimParam(s)) => Ok(Dimension::Dynamic(s.clone())),
                    None => Err(ModelLoadError::NoValueShape),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let elem_ty = DataType::from_i32(tensor.elem_type)
                .ok_or_else(|| {
                    ModelLoadError::Todo(
                        format!("Unknown tensor element type: {}", tensor.elem_type).into(),
                    )
                })?
                .try_into()?;

            let val = match name_to_val.entry(x.name.as_str()) {
                Entry::Occupied(o) => *o.get(),
                Entry::Vacant(v) => *v.insert(model.graph.values.new_val_named_and_shaped(
                    x.name.as_str(),
                    TypedShape::new(Dimensions(dims), elem_ty),
                )),
            };

            vec.push(val);
        }
    }

    // Remove initializers from inputs if needed.
    model
        .graph
        .inputs
        .retain(|&x| !model.graph.inits.contains_key(&x));

    let mut produced = graph
        .input
        .iter()
        .map(|x| x.name.as_str())
        .chain(graph.initializer.iter().map(|t| t.name.as_str()))
        .collect::<FxHashSet<_>>();

    // Load nodes.
    for node in graph.node.iter() {
        for output in node.output.iter().filter(|o| !o.is_empty()) {
            if !produced.insert(output.as_str()) {
                return Err(ModelLoadError::DuplicateValue(output.clone()));
            }
        }

        let inputs = node
            .input
            .iter()
            .map(|input| {
                *name_to_val
                    .entry(input.as_str())
                    .or_insert_with(|| model.graph.values.new_val_named(input.as_str()))
            })
            .collect();
        let outputs = node
            .output
            .iter()
            .map(|output| {
                *name_to_val
                    .entry(output.as_str())
                    .or_insert_with(|| model.graph.values.new_val_named(output.as_str()))
            })
            .collect();

        let op = match (node.domain.as_str(), node.op_type.as_str()) {
            ("" | "ai.onnx", "Add") => Op::Add,
            ("" | "ai.onnx", "Sub") => Op::Sub,
            ("" | "ai.onnx", "Mul") => Op::Mul,
            ("" | "ai.onnx", "Div") => Op::Div,
            ("" | "ai.onnx", "Pow") => Op::Pow,
            ("" | "ai.onnx", "Sqrt") => Op::Sqrt,
            ("" | "ai.onnx", "Erf") => Op::Erf,
            ("" | "ai.onnx", "Tanh") => Op::Tanh,
            ("" | "ai.onnx", "Sigmoid") => Op::Sigmoid,
            ("" | "ai.onnx", "Identity") => Op::Identity,
            ("" | "ai.onnx", "Cast") => {
                let to = get_attribute(&node.attribute, "to")?.i as i32;
                let to = DataType::from_i32(to)
                    .ok_or_else(|| {
                        ModelLoadError::Todo(format!("Unknown Cast target: {to}").into())
                    })?
                    .try_into()?;
                Op::Cast(Cast { to })
            }
            ("" | "ai.onnx", "Constant") => {
                let value = get_attribute(&node.attribute, "value")?
                    .t
                    .as_ref()
                    .ok_or(ModelLoadError::NoAttribute("value"))?;
                Op::Constant(Constant {
                    value: get_tensor(value, base_dir)?,
                })
            }
            ("" | "ai.onnx", "Gelu") => Op::Gelu(Gelu {
                approximate: match get_attribute(&node.attribute, "approximate") {
                    Ok(a) => String::from_utf8_lossy(&a.s)
                        .parse()
                        .map_err(|e: String| ModelLoadError::Todo(e.into()))?,
                    Err(_) => Default::default(),
                },
            }),
            (CONTRIB_DOMAIN, "Gelu") => Op::Gelu(Gelu::default()),
            (CONTRIB_DOMAIN, "FastGelu") => Op::FastGelu,
            (CONTRIB_DOMAIN, "QuickGelu") => Op::QuickGelu(QuickGelu {
                alpha: get_attribute(&node.attribute, "alpha")
                    .map_or(QuickGelu::default().alpha, |a| a.f),
            }),
            (domain, op_type) => {
                return Err(ModelLoadError::UnsupportedOp {
                    domain: domain.to_string(),
                    op_type: op_type.to_string(),
                })
            }
        };

        model.graph.add_node(
            Node::new(op)
                .with_name((!node.name.is_empty()).then(|| node.name.clone()))
                .with_ins(inputs)
                .with_outs(outputs),
        );
    }

    if !model.is_acyclic() {
        return Err(ModelLoadError::Cycle);
    }

    Ok(model)
}

fn get_attribute<'a>(
    attrs: &'a [AttributeProto],
    name: &'static str,
) -> Result<&'a AttributeProto, ModelLoadError> {
    attrs
        .iter()
        .find(|x| x.name == name)
        .ok_or(ModelLoadError::NoAttribute(name))
}

fn get_tensor(tensor: &TensorProto, base_dir: Option<&Path>) -> Result<Tensor, ModelLoadError> {
    let dims = FixedDimensions::from_i64(&tensor.dims);
    let data_type = DataType::from_i32(tensor.data_type).ok_or_else(|| {
        ModelLoadError::Todo(format!("Unknown data type for tensor: {}", tensor.data_type).into())
    })?;
    let elem_ty: TensorElemType = data_type.try_into()?;
    let invalid = || ModelLoadError::InvalidTensor(tensor.name.clone());

    if tensor.data_location == DataLocation::External as i32 {
        let bytes = read_external_data(tensor, base_dir)?;
        return Tensor::from_raw_bytes(dims, elem_ty, &bytes).ok_or_else(invalid);
    }

    if !tensor.raw_data.is_empty() {
        return Tensor::from_raw_bytes(dims, elem_ty, &tensor.raw_data).ok_or_else(invalid);
    }

    let total_elems = dims.total_elems();
    let tensor = match elem_ty {
        TensorElemType::F32 if tensor.float_data.len() == total_elems => {
            Tensor::new(dims, tensor.float_data.clone())
        }
        TensorElemType::I64 if tensor.int64_data.len() == total_elems => {
            Tensor::new(dims, tensor.int64_data.clone())
        }
        TensorElemType::I32 if tensor.int32_data.len() == total_elems => {
            Tensor::new(dims, tensor.int32_data.clone())
        }
        TensorElemType::Bool if tensor.int32_data.len() == total_elems => {
            Tensor::new(dims, tensor.int32_data.iter().map(|&x| x != 0).collect())
        }
        _ => return Err(invalid()),
    };
    Ok(tensor)
}

/// Reads the bytes of a tensor stored outside the model file, as described by
/// its `location`, `offset` and `length` entries.
fn read_external_data(
    tensor: &TensorProto,
    base_dir: Option<&Path>,
) -> Result<Vec<u8>, ModelLoadError> {
    let base_dir = base_dir.ok_or_else(|| ModelLoadError::NoExternalDataDir(tensor.name.clone()))?;
    let entry = |key: &str| {
        tensor
            .external_data
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    };
    let invalid = || ModelLoadError::InvalidTensor(tensor.name.clone());

    let location = entry("location").ok_or_else(invalid)?;
    let offset = entry("offset").map_or(Ok(0), str::parse::<usize>).map_err(|_| invalid())?;
    let data = fs::read(base_dir.join(location))?;
    let length = match entry("length") {
        Some(len) => len.parse::<usize>().map_err(|_| invalid())?,
        None => data.len().saturating_sub(offset),
    };

    offset
        .checked_add(length)
        .and_then(|end| data.get(offset..end))
        .map(<[u8]>::to_vec)
        .ok_or_else(invalid)
}

impl TryFrom<DataType> for TensorElemType {
    type Error = ModelLoadError;

    fn try_from(ty: DataType) -> Result<Self, Self::Error> {
        match ty {
            DataType::Bool => Ok(TensorElemType::Bool),
            DataType::Int32 => Ok(TensorElemType::I32),
            DataType::Int64 => Ok(TensorElemType::I64),
            DataType::Float => Ok(TensorElemType::F32),
            ty => Err(ModelLoadError::Todo(
                format!("Unsupported tensor element type: {ty:?}").into(),
            )),
        }
    }
}

#[test]
fn load_garbage() {
    assert!(matches!(
        load_onnx_from_buffer(&[0xff, 0xff, 0xff]),
        Err(ModelLoadError::InvalidModel(_))
    ));
}

#[test]
fn load_without_graph() {
    let buf = ModelProto::default().encode_to_vec();
    assert!(matches!(
        load_onnx_from_buffer(&buf),
        Err(ModelLoadError::NoGraph)
    ));
}

#[test]
fn load_unknown_op() {
    use super::proto::{GraphProto, NodeProto, OperatorSetIdProto};

    let model = ModelProto {
        ir_version: 8,
        opset_import: vec![OperatorSetIdProto {
            domain: "".into(),
            version: 17,
        }],
        graph: Some(GraphProto {
            node: vec![NodeProto {
                op_type: "Conv".into(),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    };
    let err = load_onnx_from_buffer(&model.encode_to_vec()).unwrap_err();
    assert_eq!(err.to_string(), "Unsupported op: ::Conv");
}

#[cfg(test)]
fn tanh_node(input: &str, output: &str) -> super::proto::NodeProto {
    super::proto::NodeProto {
        op_type: "Tanh".into(),
        input: vec![input.into()],
        output: vec![output.into()],
        ..Default::default()
    }
}

#[cfg(test)]
fn model_with(graph: super::proto::GraphProto) -> ModelProto {
    use super::proto::OperatorSetIdProto;

    ModelProto {
        ir_version: 8,
        opset_import: vec![OperatorSetIdProto {
            domain: "".into(),
            version: 17,
        }],
        graph: Some(graph),
        ..Default::default()
    }
}

#[test]
fn load_duplicate_value() {
    use super::proto::GraphProto;

    let model = model_with(GraphProto {
        node: vec![tanh_node("a", "b"), tanh_node("b", "b")],
        ..Default::default()
    });
    let err = load_onnx_from_buffer(&model.encode_to_vec()).unwrap_err();
    assert!(matches!(err, ModelLoadError::DuplicateValue(name) if name == "b"));
}

#[test]
fn load_cycle() {
    use super::proto::GraphProto;

    let model = model_with(GraphProto {
        node: vec![tanh_node("a", "b"), tanh_node("b", "a")],
        ..Default::default()
    });
    assert!(matches!(
        load_onnx_from_buffer(&model.encode_to_vec()),
        Err(ModelLoadError::Cycle)
    ));
}

#[test]
fn load_external_data_out_of_range() {
    use super::proto::{GraphProto, StringStringEntryProto};

    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("model.onnx.data"), [0u8; 8]).unwrap();

    let entry = |key: &str, value: &str| StringStringEntryProto {
        key: key.into(),
        value: value.into(),
    };
    let init = |offset: &str| TensorProto {
        name: "w".into(),
        data_type: DataType::Float as i32,
        data_location: DataLocation::External as i32,
        external_data: vec![
            entry("location", "model.onnx.data"),
            entry("offset", offset),
            entry("length", "4"),
        ],
        ..Default::default()
    };
    let load = |offset: &str| {
        let model = model_with(GraphProto {
            initializer: vec![init(offset)],
            ..Default::default()
        });
        load_onnx_from_model_proto(model, Some(dir.path()))
    };

    let model = load("4").unwrap();
    assert_eq!(model.graph.inits.len(), 1);
    for offset in ["6", &usize::MAX.to_string()] {
        assert!(matches!(
            load(offset),
            Err(ModelLoadError::InvalidTensor(name)) if name == "w"
        ));
    }
}
