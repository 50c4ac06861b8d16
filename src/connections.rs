// Connection selection between nearby souls

use ::rand as external_rand;
use external_rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::lod::LodHint;
use crate::soul::{Soul, SoulId};
use crate::spatial::SpatialIndex;
use crate::types::{Rgb, Vec3};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub start_pos: Vec3,
    pub end_pos: Vec3,
    #[serde(rename = "colorRGB")]
    pub color_rgb: Rgb,
}

pub struct ConnectionParams {
    pub interaction_distance: f32,
    pub max_lines_multiplier: f32,
    /// Souls examined per step, highest LOD tiers first.
    pub check_budget: usize,
}

/// Most edges a step may emit for `population` souls.
pub fn connection_cap(population: usize, max_lines_multiplier: f32) -> usize {
    if !(max_lines_multiplier.is_finite() && max_lines_multiplier > 0.0) {
        return 0;
    }
    (population as f64 * max_lines_multiplier as f64).floor() as usize
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    distance_sq: f32,
    low_id: SoulId,
    high_id: SoulId,
    a: usize,
    b: usize,
}

/// Recompute edges from scratch. `index` must hold the current positions of
/// `souls` keyed by slice index, and `hints`/`colors` are parallel to `souls`.
///
/// Candidates are ordered by (distance², lower id, higher id); the closest
/// pairs are offered first and each is kept with probability equal to the
/// product of both endpoints' connection multipliers, until the cap.
pub fn compute_connections<R: Rng>(
    souls: &[Soul],
    hints: &[LodHint],
    colors: &[Rgb],
    index: &SpatialIndex,
    params: &ConnectionParams,
    rng: &mut R,
) -> Vec<Connection> {
    let cap = connection_cap(souls.len(), params.max_lines_multiplier);
    if cap == 0 || params.check_budget == 0 {
        return Vec::new();
    }

    // Highest detail first, id order within a tier
    let mut order: Vec<usize> = (0..souls.len())
        .filter(|&i| !hints[i].tier.is_culled())
        .collect();
    order.sort_by_key(|&i| (hints[i].tier, souls[i].id));
    order.truncate(params.check_budget);

    let mut seen: HashSet<(SoulId, SoulId)> = HashSet::new();
    let mut candidates = Vec::new();
    for &a in &order {
        for (b, distance_sq) in index.query_neighbors(souls[a].position, params.interaction_distance) {
            if b == a || hints[b].tier.is_culled() {
                continue;
            }
            let (low_id, high_id) = if souls[a].id < souls[b].id {
                (souls[a].id, souls[b].id)
            } else {
                (souls[b].id, souls[a].id)
            };
            if seen.insert((low_id, high_id)) {
                candidates.push(Candidate {
                    distance_sq,
                    low_id,
                    high_id,
                    a,
                    b,
                });
            }
        }
    }

    candidates.sort_by(|x, y| {
        x.distance_sq
            .total_cmp(&y.distance_sq)
            .then(x.low_id.cmp(&y.low_id))
            .then(x.high_id.cmp(&y.high_id))
    });

    let mut edges = Vec::with_capacity(cap.min(candidates.len()));
    for c in candidates {
        if edges.len() >= cap {
            break;
        }
        let keep = (hints[c.a].connection_multiplier * hints[c.b].connection_multiplier).clamp(0.0, 1.0);
        if keep <= 0.0 || (keep < 1.0 && rng.gen::<f32>() >= keep) {
            continue;
        }
        edges.push(Connection {
            start_pos: souls[c.a].position,
            end_pos: souls[c.b].position,
            color_rgb: colors[c.a].blend(colors[c.b]),
        });
    }
    edges
}
