//! Weighted node selection.
//!
//! Candidates must advertise the task's type (empty list = all) and have
//! spare slots. Each candidate is scored; the base term penalizes load
//! linearly in running tasks, the resource factors penalize cpu, memory,
//! and network stress, affinity lightly biases toward nodes with history
//! for the type, and high/critical tasks amplify the resource terms so
//! they avoid stressed nodes more aggressively. Ties break by lower
//! running count, then by node id, making the choice deterministic for a
//! given snapshot.

use dragnet_store::{Task, TaskPriority};

use crate::nodes::NodeHandle;

/// Combined in+out network throughput (KB/s) treated as saturation.
const NET_SATURATION_KBPS: f64 = 102_400.0;

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// Memory pressure percentage; 50 when the node's budget is unknown.
fn memory_pct(node: &NodeHandle) -> f64 {
    match node.max_memory_bytes {
        Some(max) if max > 0 => node.memory_usage_bytes as f64 / max as f64 * 100.0,
        _ => 50.0,
    }
}

/// Score one candidate for one task. Higher is better.
pub fn score_node(task: &Task, node: &NodeHandle) -> f64 {
    let base = 100.0 / (1.0 + node.running_tasks as f64);
    let cpu_factor = 1.0 - 0.8 * clamp01(node.cpu_usage_pct / 100.0);
    let mem_factor = 1.0 - 0.6 * clamp01(memory_pct(node) / 100.0);
    let net_factor =
        1.0 - 0.4 * clamp01((node.net_in_kbps + node.net_out_kbps) / NET_SATURATION_KBPS);
    let affinity_factor = if node.type_history.get(&task.task_type).copied().unwrap_or(0) > 0 {
        1.2
    } else {
        1.0
    };

    let mut score = base * cpu_factor * mem_factor * net_factor * affinity_factor;
    if task.priority >= TaskPriority::High {
        score *= (cpu_factor * 1.5) * (mem_factor * 1.3);
    }
    score
}

/// Pick the best node for a task from a snapshot of online nodes.
///
/// Returns `None` when no candidate advertises the type with spare
/// capacity. Deterministic: identical snapshots yield identical choices.
pub fn select_node<'a>(task: &Task, nodes: &'a [NodeHandle]) -> Option<&'a NodeHandle> {
    nodes
        .iter()
        .filter(|n| n.accepts(task.task_type) && n.has_capacity())
        .map(|n| (score_node(task, n), n))
        .max_by(|(score_a, a), (score_b, b)| {
            score_a
                .total_cmp(score_b)
                .then_with(|| b.running_tasks.cmp(&a.running_tasks))
                .then_with(|| b.node_id.cmp(&a.node_id))
        })
        .map(|(_, n)| n)
}
