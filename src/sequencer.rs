//! Dependency ordering for derived features.

use std::collections::HashMap;

use crate::error::{RegistryError, Result};
use crate::models::{DerivedKey, FeatureGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Order `requested` so every derived feature comes after the derived
/// features it consumes.
///
/// Depth-first postorder: roots are visited in the order given, dependencies
/// in declared order, so identical input always yields the same sequence.
/// Derived dependencies outside `requested` are pulled in as well, since they
/// need an id before their consumers can be encoded. Anchored inputs are
/// ignored.
pub fn registration_order(
    graph: &FeatureGraph,
    requested: impl IntoIterator<Item = DerivedKey>,
) -> Result<Vec<DerivedKey>> {
    let mut marks: HashMap<DerivedKey, Mark> = HashMap::new();
    let mut order = Vec::new();

    for root in requested {
        if marks.contains_key(&root) {
            continue;
        }
        marks.insert(root, Mark::Visiting);
        // (node, index of the next derived input to visit)
        let mut stack = vec![(root, 0usize)];

        while let Some(top) = stack.last_mut() {
            let (node, cursor) = *top;
            match graph.derived(node).derived_inputs().nth(cursor) {
                Some(dep) => {
                    top.1 += 1;
                    match marks.get(&dep) {
                        Some(Mark::Done) => {}
                        Some(Mark::Visiting) => {
                            tracing::debug!(
                                entry = %graph.derived(dep).name,
                                from = %graph.derived(node).name,
                                "derived feature cycle"
                            );
                            return Err(RegistryError::CyclicDependency {
                                entry: graph.derived(dep).name.clone(),
                            });
                        }
                        None => {
                            marks.insert(dep, Mark::Visiting);
                            stack.push((dep, 0));
                        }
                    }
                }
                None => {
                    marks.insert(node, Mark::Done);
                    order.push(node);
                    stack.pop();
                }
            }
        }
    }

    Ok(order)
}
