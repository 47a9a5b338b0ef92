//! Model introspection: shape inference and graph extraction.

pub mod extract;
pub mod shape;

pub use extract::{
    describe, extract_graph, EdgeKind, GraphEdge, ModelGraph, ModuleNode, INPUT_NODE_ID,
};
pub use shape::infer_output_shape;
