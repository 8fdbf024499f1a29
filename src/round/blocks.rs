//! Block extraction

use crate::nn::{BlockPath, Module};

/// Select the blocks to optimize independently.
///
/// Depth-first traversal of the model's named children: a node matching the
/// predicate becomes a block and its subtree is not expanded further (the
/// coarse boundary wins over any nested match); otherwise recursion
/// continues into the node. Paths come back in traversal order, which
/// callers treat as a valid front-to-back processing order — the extractor
/// does not verify block independence.
pub fn get_blocks(
    model: &mut dyn Module,
    predicate: &dyn Fn(&dyn Module, &str) -> bool,
) -> Vec<BlockPath> {
    let mut blocks = Vec::new();
    let mut prefix = Vec::new();
    walk(model, &mut prefix, predicate, &mut blocks);
    blocks
}

fn walk(
    module: &mut dyn Module,
    prefix: &mut Vec<String>,
    predicate: &dyn Fn(&dyn Module, &str) -> bool,
    blocks: &mut Vec<BlockPath>,
) {
    for (name, child) in module.named_children() {
        if predicate(&*child, &name) {
            let mut segments = prefix.clone();
            segments.push(name);
            blocks.push(BlockPath::new(segments));
        } else {
            prefix.push(name);
            walk(child, prefix, predicate, blocks);
            prefix.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{QuantLinear, Sequential};
    use crate::quant::QuantConfig;

    fn layer() -> QuantLinear {
        QuantLinear::new(vec![0.1, 0.2, 0.3, 0.4], 2, 2, QuantConfig::q8_symmetric())
    }

    fn nested_model() -> Sequential {
        Sequential::new()
            .push("embed", layer())
            .push(
                "block0",
                Sequential::new().push("fc1", layer()).push("fc2", layer()),
            )
            .push(
                "block1",
                Sequential::new().push("fc1", layer()).push("fc2", layer()),
            )
            .push("head", layer())
    }

    #[test]
    fn test_blocks_in_traversal_order() {
        let mut model = nested_model();
        let blocks = get_blocks(&mut model, &|_, name| name.starts_with("block"));

        let paths: Vec<String> = blocks.iter().map(|p| p.to_string()).collect();
        assert_eq!(paths, vec!["block0", "block1"]);
    }

    #[test]
    fn test_coarse_boundary_wins_over_nested_match() {
        let mut model = nested_model();
        // "fc1" would also match inside each block, but the block match
        // stops the descent first
        let blocks = get_blocks(&mut model, &|_, name| {
            name.starts_with("block") || name == "fc1"
        });

        let paths: Vec<String> = blocks.iter().map(|p| p.to_string()).collect();
        assert_eq!(paths, vec!["block0", "block1"]);
    }

    #[test]
    fn test_recursion_reaches_nested_leaves() {
        let mut model = nested_model();
        let blocks = get_blocks(&mut model, &|_, name| name == "fc2");

        let paths: Vec<String> = blocks.iter().map(|p| p.to_string()).collect();
        assert_eq!(paths, vec!["block0.fc2", "block1.fc2"]);
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let mut model = nested_model();
        let predicate = |_: &dyn Module, name: &str| name.starts_with("block");

        let first = get_blocks(&mut model, &predicate);
        let second = get_blocks(&mut model, &predicate);
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_match_yields_empty() {
        let mut model = nested_model();
        let blocks = get_blocks(&mut model, &|_, name| name == "decoder");
        assert!(blocks.is_empty());
    }
}
