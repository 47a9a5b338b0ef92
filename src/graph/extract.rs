//! Model-graph extraction for the client's architecture view.
//!
//! Walks the built module tree breadth-first and emits one node per module
//! with live-inferred shapes, plus edges describing sequential flow between
//! siblings and parent/child containment. The traversal operates on a tree,
//! so no cycle detection is needed; ids are allocated in FIFO order, which
//! guarantees every node's parent was emitted before it.

use std::collections::VecDeque;

use burn::tensor::backend::Backend;
use serde::Serialize;

use crate::model::{DynLayer, DynamicCnn};

use super::shape::infer_output_shape;

/// Reserved id of the synthetic input node.
pub const INPUT_NODE_ID: usize = 0;

/// One module of the extracted graph.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleNode {
    /// Unique within one graph instance.
    pub id: usize,
    /// Short human label.
    pub label: String,
    /// Fully qualified path name ("features.0.1").
    pub name: String,
    /// Module type tag ("Conv2d", "Sequential", ...).
    pub module_type: String,
    /// Per-sample input shape.
    pub input_shape: Vec<usize>,
    /// Per-sample output shape, inferred by probing.
    pub output_shape: Vec<usize>,
    /// This module's own (non-recursive) parameter element count.
    pub param_count: usize,
    /// Whether the node has renderable children.
    pub has_children: bool,
    /// Parent node id; `None` only for the input node.
    pub parent_id: Option<usize>,
    /// Nesting depth; 0 for the input node.
    pub level: usize,
}

/// Edge kinds of the extracted graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EdgeKind {
    #[serde(rename = "sequential-flow")]
    SequentialFlow,
    #[serde(rename = "parent-child")]
    ParentChild,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub from: usize,
    pub to: usize,
    pub kind: EdgeKind,
}

/// The serializable node/edge graph sent to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelGraph {
    pub nodes: Vec<ModuleNode>,
    pub edges: Vec<GraphEdge>,
}

struct QueueItem<'a, B: Backend> {
    module: &'a DynLayer<B>,
    id: usize,
    parent_id: usize,
    name: String,
    label: String,
    level: usize,
    input_shape: Vec<usize>,
    prev_sibling: Option<usize>,
}

/// Extract the renderable graph of a built model.
///
/// `input_shape` is the per-sample dataset shape; it becomes the synthetic
/// input node and seeds shape inference for the top-level children.
pub fn extract_graph<B: Backend>(
    model: &DynamicCnn<B>,
    input_shape: &[usize],
    device: &B::Device,
) -> ModelGraph {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    let mut next_id = INPUT_NODE_ID + 1;

    nodes.push(ModuleNode {
        id: INPUT_NODE_ID,
        label: "Input".to_string(),
        name: "input".to_string(),
        module_type: "Input".to_string(),
        input_shape: input_shape.to_vec(),
        output_shape: input_shape.to_vec(),
        param_count: 0,
        has_children: false,
        parent_id: None,
        level: 0,
    });

    let mut queue: VecDeque<QueueItem<'_, B>> = VecDeque::new();

    // Top-level children are family-specific and keep their declared order.
    let mut prev: Option<usize> = None;
    for (name, module) in model.graph_roots() {
        let id = next_id;
        next_id += 1;
        queue.push_back(QueueItem {
            module,
            id,
            parent_id: INPUT_NODE_ID,
            label: format!("{} ({})", name, module.type_tag()),
            name,
            level: 1,
            input_shape: input_shape.to_vec(),
            prev_sibling: prev,
        });
        prev = Some(id);
    }

    while let Some(item) = queue.pop_front() {
        let output_shape = infer_output_shape(item.module, &item.input_shape, device);

        nodes.push(ModuleNode {
            id: item.id,
            label: item.label,
            name: item.name.clone(),
            module_type: item.module.type_tag().to_string(),
            input_shape: item.input_shape,
            output_shape: output_shape.clone(),
            param_count: item.module.own_param_count(),
            has_children: item.module.has_children(),
            parent_id: Some(item.parent_id),
            level: item.level,
        });

        edges.push(match item.prev_sibling {
            Some(sibling) => GraphEdge {
                from: sibling,
                to: item.id,
                kind: EdgeKind::SequentialFlow,
            },
            None => GraphEdge {
                from: item.parent_id,
                to: item.id,
                kind: EdgeKind::ParentChild,
            },
        });

        // Children are sorted by name for deterministic output; sibling
        // order within the sorted sequence is preserved through the
        // previous-sibling linkage. They all inherit this node's output
        // shape as their input shape.
        let mut children = item.module.children();
        children.sort_by(|a, b| a.0.cmp(&b.0));

        let mut prev: Option<usize> = None;
        for (child_name, child) in children {
            let id = next_id;
            next_id += 1;
            queue.push_back(QueueItem {
                module: child,
                id,
                parent_id: item.id,
                label: format!("{} ({})", child_name, child.type_tag()),
                name: format!("{}.{}", item.name, child_name),
                level: item.level + 1,
                input_shape: output_shape.clone(),
                prev_sibling: prev,
            });
            prev = Some(id);
        }
    }

    ModelGraph { nodes, edges }
}

/// Render an indented text summary of the model, in the spirit of printing
/// the module tree.
pub fn describe<B: Backend>(model: &DynamicCnn<B>) -> String {
    use burn::module::Module;

    let mut out = format!(
        "DynamicCnn[{}] ({} parameters)\n",
        model.family().name(),
        model.num_params()
    );
    for (name, module) in model.graph_roots() {
        describe_module(&mut out, &name, module, 1);
    }
    out
}

fn describe_module<B: Backend>(out: &mut String, name: &str, module: &DynLayer<B>, depth: usize) {
    let indent = "  ".repeat(depth);
    let params = module.own_param_count();
    if params > 0 {
        out.push_str(&format!(
            "{indent}{name} ({}) [{params} params]\n",
            module.type_tag()
        ));
    } else {
        out.push_str(&format!("{indent}{name} ({})\n", module.type_tag()));
    }
    for (child_name, child) in module.children() {
        describe_module(out, &child_name, child, depth + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InferenceBackend;
    use crate::model::{build_model, ArchitectureConfig};
    use crate::INPUT_SHAPE;
    use std::collections::{HashMap, HashSet};

    type B = InferenceBackend;

    fn extract_default(architecture: &str) -> ModelGraph {
        let device = Default::default();
        let config = ArchitectureConfig {
            architecture: architecture.to_string(),
            ..Default::default()
        };
        let model = build_model::<B>(&config, &device).unwrap();
        extract_graph(&model, &INPUT_SHAPE, &device)
    }

    #[test]
    fn test_single_root_and_unique_ids() {
        let graph = extract_default("plain");

        let roots: Vec<_> = graph
            .nodes
            .iter()
            .filter(|n| n.parent_id.is_none())
            .collect();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].id, INPUT_NODE_ID);
        assert_eq!(roots[0].level, 0);

        let ids: HashSet<_> = graph.nodes.iter().map(|n| n.id).collect();
        assert_eq!(ids.len(), graph.nodes.len());
    }

    #[test]
    fn test_edges_reference_known_nodes_and_graph_is_connected() {
        let graph = extract_default("plain");
        let ids: HashSet<_> = graph.nodes.iter().map(|n| n.id).collect();

        for edge in &graph.edges {
            assert!(ids.contains(&edge.from), "edge from unknown id {}", edge.from);
            assert!(ids.contains(&edge.to), "edge to unknown id {}", edge.to);
        }

        // Every node except the input is the target of exactly one edge, and
        // following edges from the input reaches everything.
        let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();
        for edge in &graph.edges {
            adjacency.entry(edge.from).or_default().push(edge.to);
        }
        let mut reached = HashSet::from([INPUT_NODE_ID]);
        let mut stack = vec![INPUT_NODE_ID];
        while let Some(id) = stack.pop() {
            for &next in adjacency.get(&id).into_iter().flatten() {
                if reached.insert(next) {
                    stack.push(next);
                }
            }
        }
        assert_eq!(reached.len(), graph.nodes.len());
    }

    #[test]
    fn test_parents_emitted_before_children() {
        let graph = extract_default("plain");
        let position: HashMap<usize, usize> = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id, i))
            .collect();

        for node in &graph.nodes {
            if let Some(parent) = node.parent_id {
                assert!(position[&parent] < position[&node.id]);
            }
        }
    }

    #[test]
    fn test_top_level_order_and_sibling_edges() {
        let graph = extract_default("plain");

        let features = graph.nodes.iter().find(|n| n.name == "features").unwrap();
        let classifier = graph.nodes.iter().find(|n| n.name == "classifier").unwrap();
        assert_eq!(features.level, 1);
        assert_eq!(classifier.level, 1);

        // features gets the parent-child edge from the input; classifier
        // chains off features sequentially.
        assert!(graph.edges.iter().any(|e| e.from == INPUT_NODE_ID
            && e.to == features.id
            && e.kind == EdgeKind::ParentChild));
        assert!(graph.edges.iter().any(|e| e.from == features.id
            && e.to == classifier.id
            && e.kind == EdgeKind::SequentialFlow));
    }

    #[test]
    fn test_conv_node_shapes_and_params() {
        let graph = extract_default("plain");
        // Default config: first trunk stage holds an 8-filter 3x3 conv.
        let conv = graph
            .nodes
            .iter()
            .find(|n| n.name == "features.0.0")
            .unwrap();
        assert_eq!(conv.module_type, "Conv2d");
        // 8 * 1 * 3 * 3 weights + 8 biases.
        assert_eq!(conv.param_count, 80);
        assert!(!conv.has_children);
    }

    #[test]
    fn test_backbone_roots_are_flattened() {
        let graph = extract_default("resnet");
        let level1: Vec<_> = graph
            .nodes
            .iter()
            .filter(|n| n.level == 1)
            .map(|n| n.name.clone())
            .collect();
        // Stem, three residual stages, global pool, classifier head.
        assert_eq!(level1.len(), 6);
        assert!(level1.contains(&"features.0".to_string()));
        assert!(level1.contains(&"classifier".to_string()));

        let residual = graph
            .nodes
            .iter()
            .find(|n| n.module_type == "ResidualBlock")
            .unwrap();
        assert!(residual.has_children);
        assert_eq!(residual.param_count, 0);
    }

    #[test]
    fn test_describe_mentions_structure() {
        let device = Default::default();
        let model = build_model::<B>(&ArchitectureConfig::default(), &device).unwrap();
        let text = describe(&model);
        assert!(text.contains("DynamicCnn[plain]"));
        assert!(text.contains("Conv2d"));
        assert!(text.contains("Linear"));
    }

    #[test]
    fn test_serialized_field_names() {
        let graph = extract_default("plain");
        let json = serde_json::to_value(&graph).unwrap();
        let node = &json["nodes"][1];
        assert!(node.get("moduleType").is_some());
        assert!(node.get("inputShape").is_some());
        assert!(node.get("parentId").is_some());
        assert!(node.get("hasChildren").is_some());
        let edge = &json["edges"][0];
        assert_eq!(edge["kind"], "parent-child");
    }
}
