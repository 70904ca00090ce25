//! Pure render-graph planning.
//!
//! Everything in this module operates on indices and masks only, without
//! touching the device, so the compile-time guarantees (culling, ordering,
//! aliasing, barrier synthesis) are directly testable.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use ash::vk;

/// Planner view of a pass.
pub(crate) struct PlanPass {
    pub stage_mask: vk::PipelineStageFlags2,
    pub side_effects: bool,
}

/// One declared access, in declaration order.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlanAccess {
    pub pass: usize,
    pub access: vk::AccessFlags2,
    pub is_write: bool,
}

/// Planner view of a resource.
pub(crate) struct PlanResource {
    pub history: Vec<PlanAccess>,
    pub transient: bool,
    pub image: bool,
    /// Layout the resource enters the frame in (UNDEFINED for transients).
    pub initial_layout: vk::ImageLayout,
    /// Layout an external consumer expects after the last use.
    pub final_layout: Option<vk::ImageLayout>,
    /// Imported resources are externally observable: their writes keep the
    /// writing pass live even without a reader inside the graph.
    pub external: bool,
}

pub(crate) struct PlanInput {
    pub passes: Vec<PlanPass>,
    pub resources: Vec<PlanResource>,
}

/// A synthesized sync2 barrier (layouts meaningful for images only).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Barrier {
    pub resource: usize,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

/// Compiled schedule.
#[derive(Debug)]
pub(crate) struct Plan {
    pub live: Vec<bool>,
    /// Live pass indices in execution order.
    pub order: Vec<usize>,
    /// Pre-barriers per execution position.
    pub barriers: Vec<Vec<Barrier>>,
    /// Barriers emitted after the last pass (hand-off to external
    /// consumers, e.g. present).
    pub final_barriers: Vec<Barrier>,
    /// Live interval per transient resource, in execution positions.
    pub live_intervals: HashMap<usize, (usize, usize)>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PlanError {
    Cycle,
}

pub(crate) fn compile(input: &PlanInput) -> Result<Plan, PlanError> {
    let live = cull(input);
    let order = topo_order(input, &live)?;
    let live_intervals = live_intervals(input, &order);
    let (barriers, final_barriers) = synthesize_barriers(input, &order);
    Ok(Plan {
        live,
        order,
        barriers,
        final_barriers,
        live_intervals,
    })
}

/// Liveness by backwards reference counting.
///
/// A pass is live iff it has side effects, or one of its writes is observed:
/// read later (before the next write) by a live pass, or lands in an
/// externally visible resource. Iterates to fixpoint.
fn cull(input: &PlanInput) -> Vec<bool> {
    let mut live: Vec<bool> = input.passes.iter().map(|p| p.side_effects).collect();

    let mut changed = true;
    while changed {
        changed = false;
        for resource in &input.resources {
            for (i, entry) in resource.history.iter().enumerate() {
                if !entry.is_write || live[entry.pass] {
                    continue;
                }
                let observed = resource.external
                    || resource.history[i + 1..]
                        .iter()
                        .take_while(|later| !later.is_write)
                        .any(|later| live[later.pass]);
                if observed {
                    live[entry.pass] = true;
                    changed = true;
                }
            }
        }
    }
    live
}

/// Kahn's algorithm over the hazard edges (RAW, WAR, WAW) between live
/// passes; ties broken by pass insertion order.
fn topo_order(input: &PlanInput, live: &[bool]) -> Result<Vec<usize>, PlanError> {
    let mut edges: HashSet<(usize, usize)> = HashSet::new();

    for resource in &input.resources {
        let mut last_writer: Option<usize> = None;
        let mut readers_since: Vec<usize> = Vec::new();
        for entry in resource.history.iter().filter(|e| live[e.pass]) {
            if entry.is_write {
                if let Some(writer) = last_writer {
                    if writer != entry.pass {
                        edges.insert((writer, entry.pass));
                    }
                }
                for &reader in &readers_since {
                    if reader != entry.pass {
                        edges.insert((reader, entry.pass));
                    }
                }
                last_writer = Some(entry.pass);
                readers_since.clear();
            } else {
                if let Some(writer) = last_writer {
                    if writer != entry.pass {
                        edges.insert((writer, entry.pass));
                    }
                }
                readers_since.push(entry.pass);
            }
        }
    }

    let mut indegree = vec![0usize; input.passes.len()];
    for &(_, to) in &edges {
        indegree[to] += 1;
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..input.passes.len())
        .filter(|&p| live[p] && indegree[p] == 0)
        .map(Reverse)
        .collect();

    let live_count = live.iter().filter(|&&l| l).count();
    let mut order = Vec::with_capacity(live_count);
    while let Some(Reverse(pass)) = ready.pop() {
        order.push(pass);
        for &(from, to) in &edges {
            if from == pass {
                indegree[to] -= 1;
                if indegree[to] == 0 {
                    ready.push(Reverse(to));
                }
            }
        }
    }

    if order.len() < live_count {
        return Err(PlanError::Cycle);
    }
    Ok(order)
}

/// `[first_use, last_use]` execution positions per transient resource.
fn live_intervals(input: &PlanInput, order: &[usize]) -> HashMap<usize, (usize, usize)> {
    let position: HashMap<usize, usize> = order
        .iter()
        .enumerate()
        .map(|(pos, &pass)| (pass, pos))
        .collect();

    let mut intervals = HashMap::new();
    for (id, resource) in input.resources.iter().enumerate() {
        if !resource.transient {
            continue;
        }
        let mut first = usize::MAX;
        let mut last = 0usize;
        let mut used = false;
        for entry in &resource.history {
            if let Some(&pos) = position.get(&entry.pass) {
                first = first.min(pos);
                last = last.max(pos);
                used = true;
            }
        }
        if used {
            intervals.insert(id, (first, last));
        }
    }
    intervals
}

/// Greedy interval partitioning for transient aliasing.
///
/// `intervals` must be the `(resource, (first, last))` pairs; `compat`
/// decides whether two resources may share memory. Resources whose
/// intervals overlap never share a group.
pub(crate) fn alias_groups(
    intervals: &[(usize, (usize, usize))],
    compat: impl Fn(usize, usize) -> bool,
) -> Vec<Vec<usize>> {
    let mut sorted: Vec<(usize, (usize, usize))> = intervals.to_vec();
    sorted.sort_by_key(|&(id, (first, _))| (first, id));

    // Per group: member list and the end of the last interval placed.
    let mut groups: Vec<(Vec<usize>, usize)> = Vec::new();
    for &(id, (first, last)) in &sorted {
        let slot = groups
            .iter_mut()
            .find(|(members, end)| *end < first && compat(members[0], id));
        match slot {
            Some((members, end)) => {
                members.push(id);
                *end = last;
            }
            None => groups.push((vec![id], last)),
        }
    }
    groups.into_iter().map(|(members, _)| members).collect()
}

/// Image layout implied by an access mask.
pub(crate) fn layout_for_access(access: vk::AccessFlags2) -> vk::ImageLayout {
    if access.intersects(
        vk::AccessFlags2::COLOR_ATTACHMENT_WRITE | vk::AccessFlags2::COLOR_ATTACHMENT_READ,
    ) {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    } else if access.intersects(
        vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
    ) {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else if access.intersects(vk::AccessFlags2::TRANSFER_WRITE) {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL
    } else if access.intersects(vk::AccessFlags2::TRANSFER_READ) {
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL
    } else if access
        .intersects(vk::AccessFlags2::SHADER_WRITE | vk::AccessFlags2::SHADER_STORAGE_WRITE)
    {
        vk::ImageLayout::GENERAL
    } else if access
        .intersects(vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_SAMPLED_READ)
    {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    } else {
        vk::ImageLayout::GENERAL
    }
}

/// Synthesizes sync2 barriers between consecutive accesses.
///
/// The first use of a resource in the frame gets a barrier sourced from
/// `(TOP_OF_PIPE, NONE)` (transitioning images out of their initial layout,
/// UNDEFINED for transients so contents are discardable). The final use of
/// a resource with an external consumer gets a hand-off barrier to
/// `(BOTTOM_OF_PIPE, NONE)` and the consumer's layout.
fn synthesize_barriers(
    input: &PlanInput,
    order: &[usize],
) -> (Vec<Vec<Barrier>>, Vec<Barrier>) {
    let position: HashMap<usize, usize> = order
        .iter()
        .enumerate()
        .map(|(pos, &pass)| (pass, pos))
        .collect();

    let mut barriers: Vec<Vec<Barrier>> = vec![Vec::new(); order.len()];
    let mut final_barriers = Vec::new();

    for (id, resource) in input.resources.iter().enumerate() {
        // Accesses of live passes, in execution order (stable for equal
        // positions, preserving within-pass declaration order).
        let mut accesses: Vec<(usize, PlanAccess)> = resource
            .history
            .iter()
            .filter_map(|entry| position.get(&entry.pass).map(|&pos| (pos, *entry)))
            .collect();
        accesses.sort_by_key(|&(pos, _)| pos);

        if accesses.is_empty() {
            continue;
        }

        struct Prev {
            stage: vk::PipelineStageFlags2,
            access: vk::AccessFlags2,
            layout: vk::ImageLayout,
            is_write: bool,
        }
        let mut prev: Option<Prev> = None;

        for &(pos, entry) in &accesses {
            let stage = input.passes[entry.pass].stage_mask;
            let new_layout = if resource.image {
                layout_for_access(entry.access)
            } else {
                vk::ImageLayout::UNDEFINED
            };

            let needed = match &prev {
                None => true,
                Some(p) => {
                    p.is_write || entry.is_write || (resource.image && p.layout != new_layout)
                }
            };
            if needed {
                let (src_stage, src_access, old_layout) = match &prev {
                    Some(p) => (p.stage, p.access, p.layout),
                    None => (
                        vk::PipelineStageFlags2::TOP_OF_PIPE,
                        vk::AccessFlags2::NONE,
                        resource.initial_layout,
                    ),
                };
                barriers[pos].push(Barrier {
                    resource: id,
                    src_stage,
                    src_access,
                    dst_stage: stage,
                    dst_access: entry.access,
                    old_layout,
                    new_layout,
                });
            }

            prev = Some(Prev {
                stage,
                access: entry.access,
                layout: new_layout,
                is_write: entry.is_write,
            });
        }

        if let Some(final_layout) = resource.final_layout {
            let prev = prev.expect("accesses checked non-empty above");
            final_barriers.push(Barrier {
                resource: id,
                src_stage: prev.stage,
                src_access: prev.access,
                dst_stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                dst_access: vk::AccessFlags2::NONE,
                old_layout: prev.layout,
                new_layout: final_layout,
            });
        }
    }

    (barriers, final_barriers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass(side_effects: bool) -> PlanPass {
        PlanPass {
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            side_effects,
        }
    }

    fn write(pass: usize) -> PlanAccess {
        PlanAccess {
            pass,
            access: vk::AccessFlags2::SHADER_WRITE,
            is_write: true,
        }
    }

    fn read(pass: usize) -> PlanAccess {
        PlanAccess {
            pass,
            access: vk::AccessFlags2::SHADER_READ,
            is_write: false,
        }
    }

    fn buffer(history: Vec<PlanAccess>) -> PlanResource {
        PlanResource {
            history,
            transient: true,
            image: false,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: None,
            external: false,
        }
    }

    #[test]
    fn test_dead_chain_is_culled() {
        // A writes R1; B reads R1 and writes R2; nobody reads R2 and B has
        // no side effects: both passes fall away.
        let input = PlanInput {
            passes: vec![pass(false), pass(false)],
            resources: vec![
                buffer(vec![write(0), read(1)]),
                buffer(vec![write(1)]),
            ],
        };
        let plan = compile(&input).unwrap();
        assert_eq!(plan.live, vec![false, false]);
        assert!(plan.order.is_empty());
    }

    #[test]
    fn test_side_effect_keeps_chain_live() {
        // Same shape, but B has side effects: liveness propagates back to A.
        let input = PlanInput {
            passes: vec![pass(false), pass(true)],
            resources: vec![
                buffer(vec![write(0), read(1)]),
                buffer(vec![write(1)]),
            ],
        };
        let plan = compile(&input).unwrap();
        assert_eq!(plan.live, vec![true, true]);
        assert_eq!(plan.order, vec![0, 1]);
    }

    #[test]
    fn test_external_write_keeps_pass_live() {
        let mut target = buffer(vec![write(0)]);
        target.transient = false;
        target.external = true;
        let input = PlanInput {
            passes: vec![pass(false)],
            resources: vec![target],
        };
        let plan = compile(&input).unwrap();
        assert_eq!(plan.live, vec![true]);
    }

    #[test]
    fn test_order_is_a_topological_sort() {
        // 2 -> 0 -> 1 via two resources, declared out of order.
        let input = PlanInput {
            passes: vec![pass(false), pass(true), pass(false)],
            resources: vec![
                buffer(vec![write(2), read(0)]),
                buffer(vec![write(0), read(1)]),
            ],
        };
        let plan = compile(&input).unwrap();
        assert_eq!(plan.order, vec![2, 0, 1]);
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        // Two independent side-effect passes execute in insertion order.
        let input = PlanInput {
            passes: vec![pass(true), pass(true)],
            resources: vec![],
        };
        let plan = compile(&input).unwrap();
        assert_eq!(plan.order, vec![0, 1]);
    }

    #[test]
    fn test_cycle_is_detected() {
        // 0 writes A after reading B; 1 writes B after reading A.
        let input = PlanInput {
            passes: vec![pass(true), pass(true)],
            resources: vec![
                buffer(vec![read(1), write(0)]),
                buffer(vec![read(0), write(1)]),
            ],
        };
        assert_eq!(compile(&input).unwrap_err(), PlanError::Cycle);
    }

    #[test]
    fn test_war_hazard_orders_reader_before_writer() {
        // Pass 0 writes R, pass 1 reads R, pass 2 overwrites R. The
        // overwrite must come after the read.
        let input = PlanInput {
            passes: vec![pass(false), pass(true), pass(true)],
            resources: vec![buffer(vec![write(0), read(1), write(2)])],
        };
        let plan = compile(&input).unwrap();
        let pos = |p: usize| plan.order.iter().position(|&x| x == p).unwrap();
        assert!(pos(1) < pos(2));
        assert!(pos(0) < pos(1));
    }

    #[test]
    fn test_live_intervals() {
        let input = PlanInput {
            passes: vec![pass(true), pass(true), pass(true)],
            resources: vec![
                buffer(vec![write(0), read(1)]),
                buffer(vec![write(2)]),
            ],
        };
        let plan = compile(&input).unwrap();
        assert_eq!(plan.live_intervals[&0], (0, 1));
        assert_eq!(plan.live_intervals[&1], (2, 2));
    }

    #[test]
    fn test_alias_groups_share_disjoint_intervals() {
        let intervals = vec![(0, (0, 1)), (1, (2, 3))];
        let groups = alias_groups(&intervals, |_, _| true);
        assert_eq!(groups, vec![vec![0, 1]]);
    }

    #[test]
    fn test_alias_groups_split_overlapping_intervals() {
        let intervals = vec![(0, (0, 2)), (1, (1, 3))];
        let groups = alias_groups(&intervals, |_, _| true);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_alias_groups_respect_compat() {
        let intervals = vec![(0, (0, 1)), (1, (2, 3))];
        let groups = alias_groups(&intervals, |_, _| false);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_adjacent_intervals_do_not_alias() {
        // A resource last used at position 1 and another first used at
        // position 1 overlap in the same pass.
        let intervals = vec![(0, (0, 1)), (1, (1, 2))];
        let groups = alias_groups(&intervals, |_, _| true);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_write_read_barrier_masks() {
        let image = PlanResource {
            history: vec![
                PlanAccess {
                    pass: 0,
                    access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                    is_write: true,
                },
                PlanAccess {
                    pass: 1,
                    access: vk::AccessFlags2::SHADER_READ,
                    is_write: false,
                },
            ],
            transient: true,
            image: true,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: None,
            external: false,
        };

        let input = PlanInput {
            passes: vec![
                PlanPass {
                    stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    side_effects: false,
                },
                PlanPass {
                    stage_mask: vk::PipelineStageFlags2::FRAGMENT_SHADER,
                    side_effects: true,
                },
            ],
            resources: vec![image],
        };
        let plan = compile(&input).unwrap();

        // First use: undefined -> color attachment from TOP_OF_PIPE.
        let first = &plan.barriers[0][0];
        assert_eq!(first.src_stage, vk::PipelineStageFlags2::TOP_OF_PIPE);
        assert_eq!(first.src_access, vk::AccessFlags2::NONE);
        assert_eq!(first.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(first.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        // Write -> read: source covers the write, destination the read.
        let second = &plan.barriers[1][0];
        assert!(second
            .src_access
            .contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE));
        assert!(second.dst_access.contains(vk::AccessFlags2::SHADER_READ));
        assert_eq!(second.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(second.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn test_final_barrier_hands_off_to_consumer() {
        let target = PlanResource {
            history: vec![PlanAccess {
                pass: 0,
                access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                is_write: true,
            }],
            transient: false,
            image: true,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: Some(vk::ImageLayout::PRESENT_SRC_KHR),
            external: true,
        };
        let input = PlanInput {
            passes: vec![PlanPass {
                stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                side_effects: false,
            }],
            resources: vec![target],
        };
        let plan = compile(&input).unwrap();

        assert_eq!(plan.final_barriers.len(), 1);
        let barrier = &plan.final_barriers[0];
        assert_eq!(barrier.dst_stage, vk::PipelineStageFlags2::BOTTOM_OF_PIPE);
        assert_eq!(barrier.dst_access, vk::AccessFlags2::NONE);
        assert_eq!(barrier.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn test_consecutive_reads_emit_no_barrier() {
        let resource = PlanResource {
            history: vec![write(0), read(1), read(2)],
            transient: true,
            image: false,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: None,
            external: false,
        };
        let input = PlanInput {
            passes: vec![pass(false), pass(true), pass(true)],
            resources: vec![resource],
        };
        let plan = compile(&input).unwrap();
        // Barriers at positions 0 (first use) and 1 (write -> read), none
        // between the two reads.
        assert_eq!(plan.barriers[0].len(), 1);
        assert_eq!(plan.barriers[1].len(), 1);
        assert_eq!(plan.barriers[2].len(), 0);
    }

    #[test]
    fn test_layout_for_access_table() {
        assert_eq!(
            layout_for_access(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            layout_for_access(vk::AccessFlags2::SHADER_READ),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            layout_for_access(vk::AccessFlags2::TRANSFER_WRITE),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        assert_eq!(
            layout_for_access(vk::AccessFlags2::TRANSFER_READ),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
        assert_eq!(
            layout_for_access(vk::AccessFlags2::SHADER_STORAGE_WRITE),
            vk::ImageLayout::GENERAL
        );
        assert_eq!(
            layout_for_access(vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
    }
}
