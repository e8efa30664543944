//! Least-loaded agent selection.

use crate::backends::Agent;

/// Position of the agent with the fewest open records.
///
/// Ties go to the earliest agent. Agents whose count is still unknown are
/// never selected.
pub fn least_loaded_index(agents: &[Agent]) -> Option<usize> {
    let mut best: Option<(usize, u32)> = None;
    for (idx, agent) in agents.iter().enumerate() {
        let Some(count) = agent.open_work_count else {
            continue;
        };
        match best {
            Some((_, lowest)) if count >= lowest => {}
            _ => best = Some((idx, count)),
        }
    }
    best.map(|(idx, _)| idx)
}

pub fn select_least_loaded(agents: &[Agent]) -> Option<&Agent> {
    least_loaded_index(agents).map(|idx| &agents[idx])
}
