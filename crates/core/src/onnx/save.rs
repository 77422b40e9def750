use std::{
    fs, io,
    path::{Path, PathBuf},
};

use prost::Message;
use thiserror::Error;

use crate::{
    dim::Dimension as Dim,
    model::Model,
    op::{Cast, Constant, Gelu, GeluApproximation, Op, QuickGelu, CONTRIB_DOMAIN, GELU_OPSET},
    tensor::{Tensor, TensorElemType, TypedShape},
};

use super::proto::{
    attribute_proto::AttributeType,
    tensor_proto::{DataLocation, DataType},
    tensor_shape_proto::{dimension::Value as DimValue, Dimension},
    type_proto::{self, Value::TensorType},
    AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, StringStringEntryProto,
    TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
};

#[derive(Error, Debug)]
pub enum ModelSaveError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("Graph input shape is not provided")]
    NoGraphInputShape,

    #[error("Unknown opset version: {0}")]
    UnknownOpsetVersion(i64),

    #[error("{op} cannot be expressed at opset {opset}")]
    UnsupportedOp { op: &'static str, opset: i64 },

    #[error("Model path has no file name: {0}")]
    InvalidPath(PathBuf),
}

/// How [`save_onnx_with`] lays out the artifact.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    external_data: bool,
    producer_name: Option<String>,
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores initializer payloads in a `<model file>.data` sidecar next to the model.
    pub fn with_external_data(mut self, external_data: bool) -> Self {
        self.external_data = external_data;
        self
    }

    pub fn with_producer_name(mut self, name: impl Into<String>) -> Self {
        self.producer_name = Some(name.into());
        self
    }
}

/// Path of the sidecar file that holds external tensor data for `path`.
pub fn external_data_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let mut name = path.as_os_str().to_owned();
    name.push(".data");
    PathBuf::from(name)
}

pub fn save_onnx(model: &Model, path: impl AsRef<Path>) -> Result<(), ModelSaveError> {
    save_onnx_with(model, path, &SaveOptions::default()).map(|_| ())
}

/// Saves `model` and returns the path of the sidecar file if one was written.
pub fn save_onnx_with(
    model: &Model,
    path: impl AsRef<Path>,
    options: &SaveOptions,
) -> Result<Option<PathBuf>, ModelSaveError> {
    fn opset_to_ir_version(opset: i64) -> Result<i64, ModelSaveError> {
        match opset {
            1..=8 => Ok(3),
            9 => Ok(4),
            10 => Ok(5),
            11 => Ok(6),
            12..=14 => Ok(7),
            15..=18 => Ok(8),
            19..=20 => Ok(9),
            21 => Ok(10),
            _ => Err(ModelSaveError::UnknownOpsetVersion(opset)),
        }
    }

    let path = path.as_ref();
    let mut external = options.external_data.then(|| ExternalData {
        location: external_data_path(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        buf: Vec::new(),
    });
    if external.as_ref().is_some_and(|e| e.location.is_empty()) {
        return Err(ModelSaveError::InvalidPath(path.to_path_buf()));
    }

    let graph = encode_graph(model, external.as_mut())?;
    let mut model_proto = ModelProto {
        ir_version: opset_to_ir_version(model.opset_version)?,
        producer_name: options.producer_name.clone().unwrap_or_default(),
        graph: Some(graph),
        ..Default::default()
    };
    model_proto.opset_import.push(OperatorSetIdProto {
        domain: "".to_string(),
        version: model.opset_version,
    });
    if model
        .graph
        .live_nodes()
        .any(|(_, n)| n.op.domain(model.opset_version) == CONTRIB_DOMAIN)
    {
        model_proto.opset_import.push(OperatorSetIdProto {
            domain: CONTRIB_DOMAIN.to_string(),
            version: 1,
        });
    }

    let sidecar = match external {
        Some(ExternalData { buf, .. }) if !buf.is_empty() => {
            let sidecar = external_data_path(path);
            fs::write(&sidecar, buf)?;
            Some(sidecar)
        }
        _ => None,
    };

    if let Err(e) = fs::write(path, model_proto.encode_to_vec()) {
        // Do not leave a sidecar behind without the model that refers to it.
        if let Some(sidecar) = &sidecar {
            if let Err(e) = fs::remove_file(sidecar) {
                log::warn!("Failed to remove {}: {e}", sidecar.display());
            }
        }
        return Err(e.into());
    }

    Ok(sidecar)
}

struct ExternalData {
    location: String,
    buf: Vec<u8>,
}

fn encode_graph(
    model: &Model,
    mut external: Option<&mut ExternalData>,
) -> Result<GraphProto, ModelSaveError> {
    let mut graph_proto = GraphProto {
        name: "main_graph".to_string(),
        ..Default::default()
    };
    let values = &model.graph.values;

    // Encode graph inputs and outputs.
    for &id in &model.graph.inputs {
        let shape = values[id]
            .shape
            .as_ref()
            .ok_or(ModelSaveError::NoGraphInputShape)?;
        graph_proto
            .input
            .push(encode_value_info(values.name_of(id), Some(shape)));
    }
    for &id in &model.graph.outputs {
        graph_proto
            .output
            .push(encode_value_info(values.name_of(id), values[id].shape.as_ref()));
    }

    // Encode initializers in a stable order.
    let mut inits = model.graph.inits.iter().collect::<Vec<_>>();
    inits.sort_by_key(|(id, _)| id.index());
    for (&id, tensor) in inits {
        let mut proto = encode_tensor(values.name_of(id), tensor);
        if let Some(external) = external.as_deref_mut() {
            let offset = external.buf.len();
            external.buf.append(&mut proto.raw_data);
            proto.data_location = DataLocation::External as i32;
            proto.external_data = vec![
                entry("location", &external.location),
                entry("offset", offset),
                entry("length", tensor.byte_len()),
            ];
        }
        graph_proto.initializer.push(proto);
    }

    // Encode nodes.
    for &node_id in &model.topo_sort_nodes() {
        let node = &model.graph.nodes[node_id];
        graph_proto.node.push(NodeProto {
            name: node.name.clone().unwrap_or_default(),
            op_type: node.op.name().to_string(),
            domain: node.op.domain(model.opset_version).to_string(),
            input: node.inputs.iter().map(|&i| values.name_of(i)).collect(),
            output: node.outputs.iter().map(|&o| values.name_of(o)).collect(),
            attribute: encode_attributes(&node.op, model.opset_version)?,
            ..Default::default()
        });
    }

    Ok(graph_proto)
}

fn encode_value_info(name: String, shape: Option<&TypedShape>) -> ValueInfoProto {
    let r#type = shape.map(|TypedShape { dims, elem_ty }| TypeProto {
        denotation: "TENSOR".to_string(),
        value: Some(TensorType(type_proto::Tensor {
            elem_type: DataType::from(*elem_ty) as i32,
            shape: Some(TensorShapeProto {
                dim: dims
                    .as_slice()
                    .iter()
                    .map(|d| Dimension {
                        denotation: String::new(),
                        value: Some(match d {
                            Dim::Fixed(d) => DimValue::DimValue(*d as i64),
                            Dim::Dynamic(d) => DimValue::DimParam(d.clone()),
                        }),
                    })
                    .collect(),
            }),
        })),
    });

    ValueInfoProto {
        name,
        r#type,
        doc_string: String::new(),
    }
}

fn encode_tensor(name: String, tensor: &Tensor) -> TensorProto {
    TensorProto {
        name,
        dims: tensor.dims().to_i64_vec(),
        data_type: DataType::from(tensor.elem_ty()) as i32,
        raw_data: tensor.to_raw_bytes(),
        ..Default::default()
    }
}

fn encode_attributes(op: &Op, opset: i64) -> Result<Vec<AttributeProto>, ModelSaveError> {
    let attr = |name: &str, ty: AttributeType| AttributeProto {
        name: name.to_string(),
        r#type: ty as i32,
        ..Default::default()
    };

    Ok(match op {
        Op::Cast(Cast { to }) => vec![AttributeProto {
            i: DataType::from(*to) as i64,
            ..attr("to", AttributeType::Int)
        }],
        Op::Constant(Constant { value }) => vec![AttributeProto {
            t: Some(encode_tensor(String::new(), value)),
            ..attr("value", AttributeType::Tensor)
        }],
        Op::Gelu(Gelu {
            approximate: GeluApproximation::Tanh,
        }) if opset < GELU_OPSET => {
            return Err(ModelSaveError::UnsupportedOp {
                op: "Gelu(approximate=tanh)",
                opset,
            })
        }
        Op::Gelu(Gelu {
            approximate: GeluApproximation::Tanh,
        }) => vec![AttributeProto {
            s: GeluApproximation::Tanh.as_str().as_bytes().to_vec(),
            ..attr("approximate", AttributeType::String)
        }],
        Op::QuickGelu(QuickGelu { alpha }) => vec![AttributeProto {
            f: *alpha,
            ..attr("alpha", AttributeType::Float)
        }],
        _ => vec![],
    })
}

fn entry(key: &str, value: impl ToString) -> StringStringEntryProto {
    StringStringEntryProto {
        key: key.to_string(),
        value: value.to_string(),
    }
}

impl From<TensorElemType> for DataType {
    fn from(ty: TensorElemType) -> Self {
        match ty {
            TensorElemType::F32 => DataType::Float,
            TensorElemType::I32 => DataType::Int32,
            TensorElemType::I64 => DataType::Int64,
            TensorElemType::Bool => DataType::Bool,
        }
    }
}

#[cfg(test)]
fn scale_model() -> Model {
    use crate::{node::Node, tensor::TypedFixedShape};

    let mut model = Model {
        opset_version: 17,
        ..Default::default()
    };
    let x = model.graph.values.new_val_named_and_shaped(
        "input",
        TypedFixedShape::new(vec![3].into(), TensorElemType::F32),
    );
    let half = model.graph.values.new_val_named("half");
    let y = model.graph.values.new_val_named_and_shaped(
        "output",
        TypedFixedShape::new(vec![3].into(), TensorElemType::F32),
    );
    model.graph.inits.insert(half, Tensor::scalar(0.5f32));
    model
        .graph
        .add_node(Node::new(Op::Mul).with_ins(vec![x, half]).with_out(y));
    model.graph.inputs.push(x);
    model.graph.outputs.push(y);
    model
}

#[test]
fn test_save_onnx() {
    use super::load::{load_onnx, load_onnx_model_proto};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scale.onnx");
    save_onnx(&scale_model(), &path).unwrap();
    assert!(!external_data_path(&path).exists());

    let proto = load_onnx_model_proto(&path).unwrap();
    assert_eq!(proto.ir_version, 8);
    assert_eq!(proto.opset_import.len(), 1);

    let model = load_onnx(&path).unwrap();
    assert_eq!(model.opset_version, 17);
    assert_eq!(model.get_nodes_by_op_type("Mul").len(), 1);
    let half = model.graph.inits.values().next().unwrap();
    assert_eq!(half.scalar_f32(), Some(0.5));
}

#[test]
fn test_save_onnx_external_data() {
    use super::load::{load_onnx, load_onnx_model_proto};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scale.onnx");
    let sidecar = save_onnx_with(
        &scale_model(),
        &path,
        &SaveOptions::new().with_external_data(true),
    )
    .unwrap();
    assert_eq!(sidecar, Some(dir.path().join("scale.onnx.data")));
    assert_eq!(fs::read(dir.path().join("scale.onnx.data")).unwrap().len(), 4);

    let proto = load_onnx_model_proto(&path).unwrap();
    let init = &proto.graph.unwrap().initializer[0];
    assert!(init.raw_data.is_empty());
    assert_eq!(init.data_location, DataLocation::External as i32);

    let model = load_onnx(&path).unwrap();
    let half = model.graph.inits.values().next().unwrap();
    assert_eq!(half.scalar_f32(), Some(0.5));
}

#[test]
fn test_save_contrib_op() {
    use super::load::{load_onnx, load_onnx_model_proto};
    use crate::node::Node;

    let mut model = scale_model();
    let x = model.graph.inputs[0];
    let y = model.graph.outputs[0];
    for (_, node) in model.graph.nodes.iter_mut() {
        node.deleted = true;
    }
    model.remove_unnecessary_nodes();
    model.graph.inits.clear();
    model
        .graph
        .add_node(Node::new(Op::QuickGelu(QuickGelu { alpha: 1.702 })).with_in(x).with_out(y));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quick.onnx");
    save_onnx(&model, &path).unwrap();

    let proto = load_onnx_model_proto(&path).unwrap();
    assert!(proto
        .opset_import
        .iter()
        .any(|o| o.domain == CONTRIB_DOMAIN && o.version == 1));

    let model = load_onnx(&path).unwrap();
    let id = model.get_nodes_by_op_type("QuickGelu")[0];
    assert_eq!(
        model.graph.nodes[id].op,
        Op::QuickGelu(QuickGelu { alpha: 1.702 })
    );
}

#[test]
fn test_save_tanh_gelu_below_opset_20() {
    use crate::node::Node;

    let mut model = scale_model();
    let x = model.graph.inputs[0];
    let y = model.graph.values.new_val();
    model.graph.add_node(
        Node::new(Op::Gelu(Gelu {
            approximate: GeluApproximation::Tanh,
        }))
        .with_in(x)
        .with_out(y),
    );

    let dir = tempfile::tempdir().unwrap();
    let err = save_onnx(&model, dir.path().join("gelu.onnx")).unwrap_err();
    assert!(matches!(err, ModelSaveError::UnsupportedOp { opset: 17, .. }));
}
